use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const MAX_LAYOUT_DIM: u8 = 4;

/// Grid of viewports, row-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StoredLayout")]
pub struct ViewportLayout {
    pub rows: u8,
    pub cols: u8,
}

/// Layout as written in a settings file, before clamping.
#[derive(Deserialize)]
struct StoredLayout {
    rows: u8,
    cols: u8,
}

impl From<StoredLayout> for ViewportLayout {
    fn from(stored: StoredLayout) -> Self {
        Self::new(stored.rows, stored.cols)
    }
}

impl Default for ViewportLayout {
    fn default() -> Self {
        Self { rows: 1, cols: 2 }
    }
}

impl ViewportLayout {
    pub const PRESETS: [ViewportLayout; 5] = [
        ViewportLayout { rows: 1, cols: 1 },
        ViewportLayout { rows: 1, cols: 2 },
        ViewportLayout { rows: 2, cols: 1 },
        ViewportLayout { rows: 2, cols: 2 },
        ViewportLayout { rows: 2, cols: 3 },
    ];

    pub fn new(rows: u8, cols: u8) -> Self {
        Self {
            rows: rows.clamp(1, MAX_LAYOUT_DIM),
            cols: cols.clamp(1, MAX_LAYOUT_DIM),
        }
    }

    pub fn viewport_count(&self) -> usize {
        self.rows as usize * self.cols as usize
    }

    /// Ids stay the same for the same slot index across layouts, so shrinking
    /// a layout keeps the leading viewports.
    pub fn viewport_ids(&self) -> Vec<String> {
        (0..self.viewport_count()).map(viewport_id).collect()
    }
}

pub fn viewport_id(index: usize) -> String {
    format!("viewport-{index}")
}

impl fmt::Display for ViewportLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

impl FromStr for ViewportLayout {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (rows, cols) = value
            .trim()
            .to_ascii_lowercase()
            .split_once('x')
            .map(|(r, c)| (r.trim().to_string(), c.trim().to_string()))
            .ok_or_else(|| format!("Layout must look like 2x2, got {value:?}"))?;
        let rows = rows
            .parse::<u8>()
            .map_err(|_| format!("Invalid layout rows in {value:?}"))?;
        let cols = cols
            .parse::<u8>()
            .map_err(|_| format!("Invalid layout columns in {value:?}"))?;
        if !(1..=MAX_LAYOUT_DIM).contains(&rows) || !(1..=MAX_LAYOUT_DIM).contains(&cols) {
            return Err(format!(
                "Layout {value:?} is outside 1x1..{MAX_LAYOUT_DIM}x{MAX_LAYOUT_DIM}"
            ));
        }
        Ok(Self { rows, cols })
    }
}
