use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use manga_caption_rust::collaborators::FontStyle;
use manga_caption_rust::transform::Dimensions;
use manga_caption_rust::{
    BatchEntry, BoundingBox, CaptionKey, CaptionStore, Pipeline, Point, Region, settings,
};

#[derive(Parser, Debug)]
#[command(
    name = "manga-caption",
    version,
    about = "Capture, translate and patch speech bubbles on manga pages"
)]
struct Cli {
    /// Read extra settings from a local TOML file
    #[arg(short = 'r', long = "read-settings", global = true)]
    read_settings: Option<String>,

    /// Enable verbose logging
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register (or re-point) a page and its raster file
    RegisterPage { slug: String, image: PathBuf },

    /// Capture one region, then OCR and translate it
    Capture {
        #[arg(short = 'p', long = "page")]
        page: String,
        #[command(flatten)]
        region: RegionArgs,
        /// Size the region was drawn at, as WIDTHxHEIGHT (default: natural size)
        #[arg(long = "displayed")]
        displayed: Option<String>,
    },

    /// Process many regions of one page, optionally cleaning them afterwards
    Batch {
        #[arg(short = 'p', long = "page")]
        page: String,
        /// JSON file with a list of natural-space regions
        #[arg(long = "regions", required_unless_present = "detect")]
        regions: Option<PathBuf>,
        /// Seed regions from the backend's text detector
        #[arg(long = "detect")]
        detect: bool,
        #[arg(long = "min-confidence", default_value_t = 0.5)]
        min_confidence: f64,
        /// Inpaint all created regions in one request
        #[arg(long = "clean")]
        clean: bool,
    },

    /// Print detected text regions without creating captions
    Detect {
        #[arg(short = 'p', long = "page")]
        page: String,
        #[arg(long = "min-confidence", default_value_t = 0.5)]
        min_confidence: f64,
    },

    /// Re-run OCR for a caption (id or slug)
    RetryExtract { caption: String },

    /// Re-run translation for a caption (id or slug)
    RetryTranslate { caption: String },

    /// Render a patch for a caption
    Patch {
        caption: String,
        /// Text line; repeat for several lines (default: translated text)
        #[arg(long = "line")]
        lines: Vec<String>,
        #[arg(long = "font-size")]
        font_size: Option<u32>,
        /// regular, bold or italic
        #[arg(long = "font-style")]
        font_style: Option<FontStyle>,
        #[arg(long = "text-color")]
        text_color: Option<String>,
        #[arg(long = "stroke-color")]
        stroke_color: Option<String>,
        #[arg(long = "stroke-width")]
        stroke_width: Option<u32>,
        #[arg(long = "transparent")]
        transparent: bool,
        #[arg(long = "generated-by", default_value = "cli")]
        generated_by: String,
    },

    /// Remove a caption's patch
    ClearPatch { caption: String },

    /// Delete a caption and its patch
    Discard { caption: String },

    /// List the captions of a page
    Captions {
        #[arg(short = 'p', long = "page")]
        page: String,
    },

    /// Bake all patches into the page raster and retire its captions
    Merge {
        #[arg(short = 'p', long = "page")]
        page: String,
    },

    /// Show backend model readiness
    Status,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct RegionArgs {
    /// Rectangle as x,y,width,height
    #[arg(long = "rect")]
    rect: Option<String>,
    /// Oval inscribed in x,y,width,height
    #[arg(long = "oval")]
    oval: Option<String>,
    /// Polygon vertices as x1,y1;x2,y2;x3,y3...
    #[arg(long = "polygon")]
    polygon: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    manga_caption_rust::logging::init(cli.verbose)?;

    let settings = settings::load_settings(cli.read_settings.as_deref().map(Path::new))?;
    let pipeline = Pipeline::from_settings(settings)?;
    let output = run(&pipeline, cli.command).await?;
    println!("{}", output);
    Ok(())
}

async fn run(pipeline: &Pipeline, command: Command) -> Result<String> {
    match command {
        Command::RegisterPage { slug, image } => {
            let image = image
                .canonicalize()
                .with_context(|| format!("page image not found: {}", image.display()))?;
            to_json(&pipeline.store().register_page(&slug, &image)?)
        }
        Command::Capture {
            page,
            region,
            displayed,
        } => {
            let region = region.into_region()?;
            let displayed = displayed.as_deref().map(parse_dimensions).transpose()?;
            to_json(&pipeline.capture(&page, region, displayed).await?)
        }
        Command::Batch {
            page,
            regions,
            detect,
            min_confidence,
            clean,
        } => {
            let page = pipeline.page(&page)?;
            let mut entries = Vec::new();
            if let Some(path) = regions {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let regions: Vec<Region> = serde_json::from_str(&content)
                    .with_context(|| format!("failed to parse regions in {}", path.display()))?;
                entries.extend(regions.into_iter().map(BatchEntry::new));
            }
            if detect {
                let seeded = pipeline
                    .orchestrator()
                    .seed_regions(page.id, min_confidence)
                    .await?;
                entries.extend(seeded.into_iter().map(BatchEntry::new));
            }
            to_json(
                &pipeline
                    .orchestrator()
                    .process_batch(page.id, entries, clean)
                    .await?,
            )
        }
        Command::Detect {
            page,
            min_confidence,
        } => {
            let page = pipeline.page(&page)?;
            to_json(
                &pipeline
                    .orchestrator()
                    .seed_regions(page.id, min_confidence)
                    .await?,
            )
        }
        Command::RetryExtract { caption } => to_json(
            &pipeline
                .orchestrator()
                .retry_extract(&CaptionKey::parse(&caption))
                .await?,
        ),
        Command::RetryTranslate { caption } => to_json(
            &pipeline
                .orchestrator()
                .retry_translate(&CaptionKey::parse(&caption))
                .await?,
        ),
        Command::Patch {
            caption,
            lines,
            font_size,
            font_style,
            text_color,
            stroke_color,
            stroke_width,
            transparent,
            generated_by,
        } => {
            let mut style = pipeline.settings().patch.clone();
            if let Some(size) = font_size {
                style.font_size = size;
            }
            if let Some(font_style) = font_style {
                style.font_style = font_style;
            }
            if let Some(color) = text_color {
                style.text_color = color;
            }
            if let Some(color) = stroke_color {
                style.stroke_color = Some(color);
            }
            if let Some(width) = stroke_width {
                style.stroke_width = width;
            }
            if transparent {
                style.transparent_background = true;
            }
            let lines = if lines.is_empty() { None } else { Some(lines) };
            to_json(
                &pipeline
                    .patches()
                    .generate(&CaptionKey::parse(&caption), lines, &style, &generated_by)
                    .await?,
            )
        }
        Command::ClearPatch { caption } => {
            to_json(&pipeline.patches().clear(&CaptionKey::parse(&caption))?)
        }
        Command::Discard { caption } => {
            to_json(&pipeline.orchestrator().discard(&CaptionKey::parse(&caption))?)
        }
        Command::Captions { page } => {
            let page = pipeline.page(&page)?;
            to_json(&pipeline.store().find_by_page(page.id)?)
        }
        Command::Merge { page } => to_json(&pipeline.merge().merge_page(&page).await?),
        Command::Status => {
            let (health, status) = pipeline.backend_status().await?;
            to_json(&serde_json::json!({ "health": health, "models": status.models }))
        }
    }
}

impl RegionArgs {
    fn into_region(self) -> Result<Region> {
        if let Some(rect) = self.rect {
            return Ok(Region::rectangle(parse_bounds(&rect)?));
        }
        if let Some(oval) = self.oval {
            return Ok(Region::oval(parse_bounds(&oval)?));
        }
        if let Some(polygon) = self.polygon {
            let points = polygon
                .split(';')
                .filter(|pair| !pair.trim().is_empty())
                .map(|pair| {
                    let values = parse_numbers(pair, 2)?;
                    Ok(Point::new(values[0], values[1]))
                })
                .collect::<Result<Vec<_>>>()?;
            return Ok(Region::polygon(points)?);
        }
        Err(anyhow!("one of --rect, --oval or --polygon is required"))
    }
}

fn parse_numbers(value: &str, expected: usize) -> Result<Vec<f64>> {
    let values = value
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<f64>()
                .with_context(|| format!("invalid number '{}'", part.trim()))
        })
        .collect::<Result<Vec<_>>>()?;
    if values.len() != expected {
        return Err(anyhow!(
            "expected {} comma-separated numbers, got '{}'",
            expected,
            value
        ));
    }
    Ok(values)
}

fn parse_bounds(value: &str) -> Result<BoundingBox> {
    let values = parse_numbers(value, 4)?;
    Ok(BoundingBox::new(values[0], values[1], values[2], values[3]))
}

fn parse_dimensions(value: &str) -> Result<Dimensions> {
    let (width, height) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| anyhow!("expected WIDTHxHEIGHT, got '{}'", value))?;
    let width = width
        .trim()
        .parse::<f64>()
        .with_context(|| format!("invalid width in '{}'", value))?;
    let height = height
        .trim()
        .parse::<f64>()
        .with_context(|| format!("invalid height in '{}'", value))?;
    Ok(Dimensions::new(width, height))
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).with_context(|| "failed to encode output")
}
