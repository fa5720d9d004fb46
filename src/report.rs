//! Recognition of the model's terminal answer.
//!
//! A reply ends the session when it carries the `[STOP]` terminator, or when
//! it contains a `FINAL GEOLOCATION REPORT` block with parseable coordinates.
//! Anything else is ordinary reasoning.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

pub const STOP_MARKER: &str = "[STOP]";
pub const REPORT_HEADING: &str = "FINAL GEOLOCATION REPORT";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FinalReport {
    pub feature_name: Option<String>,
    pub address: Option<String>,
    pub context: Option<String>,
    pub coordinates: Option<Coordinates>,
    pub maps_link: Option<String>,
    pub verification: Option<String>,
    /// The reply text with the terminator removed.
    pub verdict: String,
}

impl FinalReport {
    pub fn has_location(&self) -> bool {
        self.coordinates.is_some() || self.address.is_some() || self.feature_name.is_some()
    }

    /// Text for the `session_end` event.
    pub fn summary(&self) -> String {
        if !self.has_location() {
            return self.verdict.clone();
        }
        let mut lines = Vec::new();
        if let Some(f) = &self.feature_name {
            lines.push(format!("Feature: {f}"));
        }
        if let Some(a) = &self.address {
            lines.push(format!("Address: {a}"));
        }
        if let Some(c) = &self.coordinates {
            lines.push(format!("Coordinates: {:.6}, {:.6}", c.latitude, c.longitude));
        }
        if let Some(l) = &self.maps_link {
            lines.push(format!("Map: {l}"));
        }
        lines.join("\n")
    }
}

fn field_regex(label: &str) -> Regex {
    // "*   **Feature Name:** Eiffel Tower" and plain "Feature Name: ..." alike
    Regex::new(&format!(r"(?im)^[\s*\-]*{}\s*:\s*\**\s*(.+?)\s*$", regex::escape(label)))
        .expect("static field pattern")
}

struct Patterns {
    feature: Regex,
    address: Regex,
    context: Regex,
    coordinates: Regex,
    maps: Regex,
    verification: Regex,
    latlon: Regex,
}

fn patterns() -> &'static Patterns {
    static P: OnceLock<Patterns> = OnceLock::new();
    P.get_or_init(|| Patterns {
        feature: field_regex("Feature Name"),
        address: field_regex("Address"),
        context: field_regex("Context"),
        coordinates: field_regex("Coordinates"),
        maps: field_regex("Google Maps Link"),
        verification: field_regex("Verification Summary"),
        latlon: Regex::new(
            r"(?i)(-?\d{1,3}(?:\.\d+)?)\s*°?\s*([NS])?\s*,\s*(-?\d{1,3}(?:\.\d+)?)\s*°?\s*([EW])?",
        )
        .expect("static coordinate pattern"),
    })
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim_matches(|c: char| c == '[' || c == ']' || c.is_whitespace()).to_string())
        .filter(|s| !s.is_empty())
}

pub fn parse_coordinates(text: &str) -> Option<Coordinates> {
    let c = patterns().latlon.captures(text)?;
    let mut lat: f64 = c.get(1)?.as_str().parse().ok()?;
    let mut lon: f64 = c.get(3)?.as_str().parse().ok()?;
    if c.get(2).is_some_and(|h| h.as_str().eq_ignore_ascii_case("s")) {
        lat = -lat.abs();
    }
    if c.get(4).is_some_and(|h| h.as_str().eq_ignore_ascii_case("w")) {
        lon = -lon.abs();
    }
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return None;
    }
    Some(Coordinates { latitude: lat, longitude: lon })
}

fn has_stop_marker(text: &str) -> bool {
    text.to_ascii_lowercase().contains(&STOP_MARKER.to_ascii_lowercase())
}

fn strip_stop_marker(text: &str) -> String {
    let lower = text.to_ascii_lowercase();
    let marker = STOP_MARKER.to_ascii_lowercase();
    match lower.find(&marker) {
        Some(i) => format!("{}{}", &text[..i], &text[i + marker.len()..]).trim().to_string(),
        None => text.trim().to_string(),
    }
}

/// Returns the final report when `text` is a terminal answer.
pub fn parse_final_report(text: &str) -> Option<FinalReport> {
    let stop = has_stop_marker(text);
    let has_heading = text.to_ascii_uppercase().contains(REPORT_HEADING);
    if !stop && !has_heading {
        return None;
    }

    let p = patterns();
    let coordinates = capture(&p.coordinates, text).and_then(|c| parse_coordinates(&c));
    if !stop && coordinates.is_none() {
        // A heading without usable coordinates is still work in progress.
        return None;
    }

    Some(FinalReport {
        feature_name: capture(&p.feature, text),
        address: capture(&p.address, text),
        context: capture(&p.context, text),
        coordinates,
        maps_link: capture(&p.maps, text),
        verification: capture(&p.verification, text),
        verdict: strip_stop_marker(text),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = "Confirmed via search.\n\n**FINAL GEOLOCATION REPORT**\n\
*   **Feature Name:** Pont de Bir-Hakeim\n\
*   **Address:** Pont de Bir-Hakeim, 75015 Paris, France\n\
*   **Context:** Metro line 6 viaduct\n\
*   **Coordinates:** 48.8556, 2.2874\n\
*   **Google Maps Link:** https://www.google.com/maps/search/?api=1&query=48.8556,2.2874\n\
*   **Verification Summary:** Signage and viaduct shape match.\n\n[STOP]";

    #[test]
    fn parses_full_report() {
        let r = parse_final_report(REPORT).unwrap();
        assert_eq!(r.feature_name.as_deref(), Some("Pont de Bir-Hakeim"));
        assert_eq!(r.address.as_deref(), Some("Pont de Bir-Hakeim, 75015 Paris, France"));
        assert_eq!(r.context.as_deref(), Some("Metro line 6 viaduct"));
        let c = r.coordinates.unwrap();
        assert!((c.latitude - 48.8556).abs() < 1e-9);
        assert!((c.longitude - 2.2874).abs() < 1e-9);
        assert!(r.maps_link.unwrap().starts_with("https://www.google.com/maps"));
        assert!(!r.verdict.contains("[STOP]"));
    }

    #[test]
    fn summary_lists_location_fields() {
        let r = parse_final_report(REPORT).unwrap();
        let s = r.summary();
        assert!(s.contains("Feature: Pont de Bir-Hakeim"));
        assert!(s.contains("Coordinates: 48.855600, 2.287400"));
    }

    #[test]
    fn stop_without_report_uses_verdict() {
        let r = parse_final_report("This is a generic stock photo, impossible to place. [stop]").unwrap();
        assert!(!r.has_location());
        assert_eq!(r.summary(), "This is a generic stock photo, impossible to place.");
    }

    #[test]
    fn heading_with_coordinates_completes_without_stop() {
        let text = "FINAL GEOLOCATION REPORT\nCoordinates: 35.6586 N, 139.7454 E";
        let r = parse_final_report(text).unwrap();
        assert_eq!(r.coordinates.unwrap().latitude, 35.6586);
    }

    #[test]
    fn heading_without_coordinates_is_not_final() {
        assert!(parse_final_report("Drafting the FINAL GEOLOCATION REPORT next.").is_none());
    }

    #[test]
    fn plain_reasoning_is_not_final() {
        assert!(parse_final_report("The signage is in Tamil; searching next.").is_none());
    }

    #[test]
    fn hemisphere_letters_set_sign() {
        let c = parse_coordinates("33.8688° S, 151.2093° E").unwrap();
        assert_eq!(c.latitude, -33.8688);
        assert_eq!(c.longitude, 151.2093);
        let c = parse_coordinates("40.7128 N, 74.0060 W").unwrap();
        assert_eq!(c.longitude, -74.006);
    }

    #[test]
    fn out_of_range_coordinates_rejected() {
        assert!(parse_coordinates("123.0, 10.0").is_none());
    }
}
