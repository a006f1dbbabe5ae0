use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub fn hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.0, self.1, self.2)
    }
}

/// Colors used to tag everything that belongs to one study.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StudyColorScheme {
    pub primary: Rgb,
    pub secondary: Rgb,
    pub accent: Rgb,
    pub text: Rgb,
}

const fn scheme(primary: Rgb, secondary: Rgb, accent: Rgb, text: Rgb) -> StudyColorScheme {
    StudyColorScheme {
        primary,
        secondary,
        accent,
        text,
    }
}

pub const STUDY_PALETTE: [StudyColorScheme; 6] = [
    // blue
    scheme(
        Rgb(59, 130, 246),
        Rgb(30, 64, 175),
        Rgb(147, 197, 253),
        Rgb(239, 246, 255),
    ),
    // green
    scheme(
        Rgb(34, 197, 94),
        Rgb(21, 128, 61),
        Rgb(134, 239, 172),
        Rgb(240, 253, 244),
    ),
    // amber
    scheme(
        Rgb(245, 158, 11),
        Rgb(180, 83, 9),
        Rgb(252, 211, 77),
        Rgb(255, 251, 235),
    ),
    // rose
    scheme(
        Rgb(244, 63, 94),
        Rgb(190, 18, 60),
        Rgb(253, 164, 175),
        Rgb(255, 241, 242),
    ),
    // violet
    scheme(
        Rgb(139, 92, 246),
        Rgb(91, 33, 182),
        Rgb(196, 181, 253),
        Rgb(245, 243, 255),
    ),
    // teal
    scheme(
        Rgb(20, 184, 166),
        Rgb(15, 118, 110),
        Rgb(94, 234, 212),
        Rgb(240, 253, 250),
    ),
];

/// Hands out palette entries round-robin in load order.
///
/// Once a study has a color it keeps it for the whole session, including
/// across unload and reload, so colors of visible studies never shift.
#[derive(Debug, Default)]
pub struct ColorAssigner {
    assigned: HashMap<String, usize>,
    next_index: usize,
}

impl ColorAssigner {
    pub fn color_for(&mut self, study_id: &str) -> StudyColorScheme {
        if let Some(index) = self.assigned.get(study_id) {
            return STUDY_PALETTE[*index % STUDY_PALETTE.len()];
        }
        let index = self.next_index;
        self.next_index = self.next_index.saturating_add(1);
        self.assigned.insert(study_id.to_string(), index);
        STUDY_PALETTE[index % STUDY_PALETTE.len()]
    }

    pub fn get(&self, study_id: &str) -> Option<StudyColorScheme> {
        self.assigned
            .get(study_id)
            .map(|index| STUDY_PALETTE[*index % STUDY_PALETTE.len()])
    }

    pub fn assigned_count(&self) -> usize {
        self.next_index
    }
}
