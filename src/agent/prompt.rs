//! Fixed prompt text fed to the model.

use crate::geometry::Dimensions;
use crate::report::{REPORT_HEADING, STOP_MARKER};

pub const INITIAL_PROMPT: &str = "Geolocate this image. Use tools to verify clues.";

pub const NUDGE: &str = "Please continue. Verify your hypothesis or give the final answer.";

pub fn system_instruction(shown: Dimensions) -> String {
    format!(
        "You are an expert geolocation agent.
Your goal: determine the precise location of the input image.

Follow this reasoning process:
1. Observation: analyze the image. Look for text (street signs, license plates, shop names), \
infrastructure (road markings, traffic lights, pole styles), nature (vegetation, sun position, soil) \
and architecture (roof styles, window shapes, materials).
2. Hypothesis: formulate a theory about the region or country.
3. Verification: use `web_search` to verify specific text, phone numbers or landmarks. Do not guess. \
Use `crop_image` to zoom into details too small to read.
4. Refinement: update your hypothesis based on tool outputs.
5. Final answer: report the location in the structured format below.

Termination:
- When you have found the location, output this report and then type {stop}:

  **{heading}**
  *   **Feature Name:** [Name of building, bridge, park, etc.]
  *   **Address:** [Full street address, City, Region, Country]
  *   **Context:** [Route number, highway name, or nearby landmarks]
  *   **Coordinates:** [Latitude, Longitude]
  *   **Google Maps Link:** https://www.google.com/maps/search/?api=1&query=[Lat],[Long]
  *   **Verification Summary:** [Which clues and searches confirm it]

- If the location cannot be determined (for example a generic stock photo), explain why and type {stop}.
- If you have no new tools to run, type {stop}.

Coordinates for `crop_image` are in a {w}x{h} space covering the whole image, \
with the origin at the top left.",
        stop = STOP_MARKER,
        heading = REPORT_HEADING,
        w = shown.width,
        h = shown.height,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_names_markers_and_space() {
        let s = system_instruction(Dimensions::new(1000, 1000));
        assert!(s.contains(STOP_MARKER));
        assert!(s.contains(REPORT_HEADING));
        assert!(s.contains("1000x1000 space"));
    }
}
