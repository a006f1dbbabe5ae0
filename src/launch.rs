use std::path::PathBuf;

use perspecta_compare::{SeriesSharing, ViewportLayout};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchRequest {
    pub paths: Vec<PathBuf>,
    pub layout: Option<ViewportLayout>,
    pub sharing: Option<SeriesSharing>,
}

impl LaunchRequest {
    fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.layout.is_none() && self.sharing.is_none()
    }
}

pub fn parse_launch_request_from_args(args: &[String]) -> Result<Option<LaunchRequest>, String> {
    if args.is_empty() {
        return Ok(None);
    }

    if args.len() == 1 && is_perspecta_uri(&args[0]) {
        return parse_perspecta_uri(&args[0]).map(Some);
    }

    let mut request = LaunchRequest::default();
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--open" => {
                let before = request.paths.len();
                while let Some(path) = iter.next_if(|value| !value.starts_with("--")) {
                    request.paths.push(PathBuf::from(path));
                }
                if request.paths.len() == before {
                    return Err("Missing file path(s) after --open.".to_string());
                }
            }
            "--layout" => {
                let value = iter
                    .next()
                    .ok_or_else(|| "Missing RxC value after --layout.".to_string())?;
                request.layout = Some(value.parse()?);
            }
            "--exclusive" => request.sharing = Some(SeriesSharing::Exclusive),
            other if other.starts_with("--") => {
                return Err(format!("Unknown option {other}."));
            }
            path => request.paths.push(PathBuf::from(path)),
        }
    }

    Ok((!request.is_empty()).then_some(request))
}

/// Parses `perspecta://open?path=...&layout=2x2`.
pub fn parse_perspecta_uri(uri: &str) -> Result<LaunchRequest, String> {
    let rest = strip_perspecta_scheme(uri)
        .ok_or_else(|| "URL must start with perspecta://".to_string())?;

    let (location, query) = split_location_and_query(rest);
    let mut request = LaunchRequest::default();

    if let Some(path_from_location) = parse_location_path(location)? {
        request.paths.push(PathBuf::from(path_from_location));
    }

    if let Some(query_string) = query {
        for pair in query_string.split('&') {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = key.trim().to_ascii_lowercase();
            let decoded_value = percent_decode(value)?;
            match key.as_str() {
                "path" | "file" => {
                    if !decoded_value.trim().is_empty() {
                        request.paths.push(PathBuf::from(decoded_value));
                    }
                }
                "paths" | "files" => {
                    request.paths.extend(
                        split_path_list(&decoded_value)
                            .into_iter()
                            .filter(|path| !path.trim().is_empty())
                            .map(PathBuf::from),
                    );
                }
                "layout" => request.layout = Some(decoded_value.parse()?),
                "sharing" => {
                    request.sharing = Some(match decoded_value.trim() {
                        "shared" => SeriesSharing::Shared,
                        "exclusive" => SeriesSharing::Exclusive,
                        other => return Err(format!("Unknown sharing mode {other:?}.")),
                    });
                }
                _ => {}
            }
        }
    }

    if request.paths.is_empty() {
        return Err("No DICOM path found in perspecta:// URL.".to_string());
    }
    Ok(request)
}

fn is_perspecta_uri(value: &str) -> bool {
    strip_perspecta_scheme(value).is_some()
}

fn strip_perspecta_scheme(uri: &str) -> Option<&str> {
    let prefix = "perspecta://";
    if uri.len() >= prefix.len() && uri[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&uri[prefix.len()..])
    } else {
        None
    }
}

fn split_location_and_query(value: &str) -> (&str, Option<&str>) {
    match value.split_once('?') {
        Some((location, query)) => (location, Some(query)),
        None => (value, None),
    }
}

fn parse_location_path(location: &str) -> Result<Option<String>, String> {
    let location = location.trim();
    if location.is_empty() || location == "/" || location.eq_ignore_ascii_case("open") {
        return Ok(None);
    }

    if location.to_ascii_lowercase().starts_with("open/") {
        let decoded = percent_decode(&location[5..])?;
        return Ok((!decoded.trim().is_empty()).then_some(decoded));
    }

    Ok(Some(percent_decode(location)?))
}

fn split_path_list(value: &str) -> Vec<&str> {
    if value.contains('|') {
        value.split('|').collect()
    } else {
        value.split(',').collect()
    }
}

fn percent_decode(value: &str) -> Result<String, String> {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'+' => {
                decoded.push(b' ');
                index += 1;
            }
            b'%' => {
                let digits = bytes.get(index + 1..index + 3);
                let byte = digits
                    .and_then(|pair| {
                        Some((decode_hex_digit(pair[0])? << 4) | decode_hex_digit(pair[1])?)
                    })
                    .ok_or_else(|| "Invalid percent-encoding in URL.".to_string())?;
                decoded.push(byte);
                index += 3;
            }
            byte => {
                decoded.push(byte);
                index += 1;
            }
        }
    }

    String::from_utf8(decoded).map_err(|_| "URL contains invalid UTF-8 after decoding.".to_string())
}

fn decode_hex_digit(value: u8) -> Option<u8> {
    match value {
        b'0'..=b'9' => Some(value - b'0'),
        b'a'..=b'f' => Some(value - b'a' + 10),
        b'A'..=b'F' => Some(value - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn parse_cli_falls_back_to_raw_paths() {
        let parsed = parse_launch_request_from_args(&args(&["prior/ct", "current/ct"]))
            .expect("args should parse")
            .expect("request expected");
        assert_eq!(
            parsed.paths,
            vec![PathBuf::from("prior/ct"), PathBuf::from("current/ct")]
        );
        assert_eq!(parsed.layout, None);
    }

    #[test]
    fn parse_cli_open_and_layout() {
        let parsed =
            parse_launch_request_from_args(&args(&["--open", "a", "b", "--layout", "2x2"]))
                .expect("args should parse")
                .expect("request expected");
        assert_eq!(parsed.paths, vec![PathBuf::from("a"), PathBuf::from("b")]);
        assert_eq!(parsed.layout, Some(ViewportLayout::new(2, 2)));
    }

    #[test]
    fn parse_cli_rejects_bad_input() {
        assert!(parse_launch_request_from_args(&args(&["--open"])).is_err());
        assert!(parse_launch_request_from_args(&args(&["--layout", "9x9"])).is_err());
        assert!(parse_launch_request_from_args(&args(&["--layout"])).is_err());
        assert!(parse_launch_request_from_args(&args(&["--frobnicate"])).is_err());
        assert_eq!(parse_launch_request_from_args(&[]), Ok(None));
    }

    #[test]
    fn parse_uri_with_paths_and_layout() {
        let request = parse_perspecta_uri(
            "perspecta://open?path=studies%2Fprior&paths=studies%2Fa|studies%2Fb&layout=1x3&sharing=exclusive",
        )
        .expect("URI should parse");
        assert_eq!(
            request,
            LaunchRequest {
                paths: vec![
                    PathBuf::from("studies/prior"),
                    PathBuf::from("studies/a"),
                    PathBuf::from("studies/b"),
                ],
                layout: Some(ViewportLayout::new(1, 3)),
                sharing: Some(SeriesSharing::Exclusive),
            }
        );
    }

    #[test]
    fn parse_uri_requires_a_path() {
        assert!(parse_perspecta_uri("perspecta://open?layout=2x2").is_err());
        assert!(parse_perspecta_uri("perspecta://open?path=%zz").is_err());
        assert!(parse_perspecta_uri("http://example").is_err());
    }

    #[test]
    fn parse_uri_location_path() {
        let request =
            parse_perspecta_uri("perspecta://open/data%20dir%2Fx.dcm").expect("URI should parse");
        assert_eq!(request.paths, vec![PathBuf::from("data dir/x.dcm")]);
    }
}
