use serde::Deserialize;
use serde_json::{json, Value};

use super::{Tool, ToolArgsError, ToolContext};
use crate::geometry::{rescale, ModelRegion};
use crate::models::ToolDeclaration;
use crate::session::ToolPayload;

pub struct CropImageTool;

/// Either an explicit region or the `(ymin, xmin, ymax, xmax)` box the model
/// is prompted with. Both are in the model's coordinate space.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CropArgs {
    Region { region: ModelRegion },
    Box { box_ymin: f64, box_xmin: f64, box_ymax: f64, box_xmax: f64 },
}

impl CropArgs {
    fn region(&self) -> ModelRegion {
        match *self {
            CropArgs::Region { region } => region,
            CropArgs::Box { box_ymin, box_xmin, box_ymax, box_xmax } => {
                ModelRegion::from_box(box_ymin, box_xmin, box_ymax, box_xmax)
            }
        }
    }
}

impl Tool for CropImageTool {
    fn name(&self) -> &'static str { "crop_image" }

    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration {
            name: self.name().into(),
            description: "Crops the original image to investigate a specific area (zoom in). \
                Coordinates are in the normalized space stated in the system instruction, \
                measured over the whole image."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "box_ymin": { "type": "integer", "description": "Top edge" },
                    "box_xmin": { "type": "integer", "description": "Left edge" },
                    "box_ymax": { "type": "integer", "description": "Bottom edge" },
                    "box_xmax": { "type": "integer", "description": "Right edge" }
                },
                "required": ["box_ymin", "box_xmin", "box_ymax", "box_xmax"]
            }),
        }
    }

    fn run<'a>(&'a self, ctx: ToolContext<'a>, args: Value) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<ToolPayload>> + Send + 'a>> {
        Box::pin(async move {
            let parsed: CropArgs = serde_json::from_value(args).map_err(|_| ToolArgsError::Invalid {
                tool: self.name(),
                reason: "expected `region: {x, y, w, h}` or numeric `box_ymin`, `box_xmin`, `box_ymax`, `box_xmax`".into(),
            })?;
            let region = parsed.region();
            region.validate()?;
            let px = rescale(&region, ctx.settings.shown_dimensions, ctx.source.dimensions);
            let image = ctx.images.crop(ctx.source, px)?;
            tracing::debug!(source = %ctx.source.id, crop = %image.id, ?px, "cropped image");
            let text = format!(
                "Image cropped successfully ({}x{} px at {},{} of the {} original). See the new image attachment.",
                px.w, px.h, px.x, px.y, ctx.source.dimensions
            );
            Ok(ToolPayload::Image { image, text })
        })
    }
}
