//! zonectl - inspect and edit the detection zone stored for a camera

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use perimeter_kernel::events::SqliteEventLog;
use perimeter_kernel::geometry::{validate_zone_area, FrameSize, Point};
use perimeter_kernel::zone::store::fallback_zone_id;
use perimeter_kernel::zone::{
    load_zone, save_zone, SqliteZoneStore, StoredZone, ZonePayload, ZoneStore,
};
use perimeter_kernel::PolygonEditor;
use std::io::IsTerminal;
use std::path::PathBuf;

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the console database.
    #[arg(long, env = "PERIMETER_DB_PATH", default_value = "perimeter.db")]
    db_path: String,
    /// Camera whose zone is managed.
    #[arg(long, env = "PERIMETER_CAMERA_ID", default_value = "camera:front_door")]
    camera_id: String,
    /// Width of the surface the points are expressed in.
    #[arg(long, default_value_t = 800.0)]
    width: f64,
    /// Height of the surface the points are expressed in.
    #[arg(long, default_value_t = 600.0)]
    height: f64,
    /// Minimum zone area in px² on that surface.
    #[arg(long, env = "PERIMETER_MIN_ZONE_AREA", default_value_t = 1000.0)]
    min_area: f64,
    /// UI mode for stderr progress.
    #[arg(long, value_enum, default_value = "auto", value_name = "MODE")]
    ui: ui::UiMode,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the stored zone, placed on the surface.
    Show,
    /// Draw a zone from `x,y;x,y;...` and store it, replacing any previous one.
    Set {
        #[arg(long)]
        points: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Check a polygon against the area floor without storing it.
    Validate {
        #[arg(long)]
        points: String,
    },
    /// Import a zone payload from a JSON file (either historical shape).
    Import {
        #[arg(long)]
        file: PathBuf,
    },
    /// Remove the stored zone.
    Delete,
    /// List recent security events for the camera.
    Events {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let ui = ui::Ui::new(
        args.ui,
        std::io::stderr().is_terminal(),
        std::io::stdout().is_terminal(),
    );
    let surface = FrameSize::new(args.width, args.height);
    if !surface.is_usable() {
        return Err(anyhow!(
            "--width/--height must be positive (got {}x{})",
            args.width,
            args.height
        ));
    }
    perimeter_kernel::validate_camera_id(&args.camera_id)?;

    match &args.command {
        Command::Validate { points } => {
            let points = parse_points(points)?;
            let validation = validate_zone_area(&points, args.min_area);
            println!("{}", validation.message);
            if !validation.valid {
                return Err(anyhow!("zone rejected"));
            }
            return Ok(());
        }
        Command::Events { limit } => {
            let mut log = SqliteEventLog::open(&args.db_path)?;
            for event in log.recent(&args.camera_id, *limit)? {
                println!("{}", serde_json::to_string(&event)?);
            }
            return Ok(());
        }
        _ => {}
    }

    let mut store = {
        let stage = ui.stage("Open zone store");
        let store = SqliteZoneStore::open(&args.db_path)?;
        stage.done_with(args.db_path.clone());
        store
    };

    match args.command {
        Command::Show => {
            let stage = ui.stage("Load zone");
            let Some(zone) = load_zone(&mut store, &args.camera_id)? else {
                stage.done_with("none configured");
                return Ok(());
            };
            stage.done_with(zone.id().to_string());
            let payload = ZonePayload::capture(&zone, surface);
            println!("{}", serde_json::to_string_pretty(&payload)?);
            eprintln!(
                "area on {}x{}: {:.0} px²",
                surface.width,
                surface.height,
                perimeter_kernel::polygon_area(&payload.points)
            );
        }
        Command::Set { points, name } => {
            let points = parse_points(&points)?;
            let mut editor = PolygonEditor::new(surface);
            match load_zone(&mut store, &args.camera_id)? {
                Some(existing) => {
                    editor.edit(&existing);
                    editor.clear();
                }
                None => editor.start(name.clone().unwrap_or_default()),
            }
            for point in points {
                editor.click(point);
            }
            let mut zone = editor.finish()?;
            if let Some(name) = name {
                zone.rename(name);
            }
            let stage = ui.stage("Save zone");
            save_zone(&mut store, &args.camera_id, &zone, surface, args.min_area)?;
            stage.done_with(zone.id().to_string());
        }
        Command::Import { file } => {
            let zone = {
                let stage = ui.stage("Parse payload");
                let raw = std::fs::read_to_string(&file)
                    .with_context(|| format!("read {}", file.display()))?;
                let value: serde_json::Value = serde_json::from_str(&raw)
                    .with_context(|| format!("parse {}", file.display()))?;
                let stored = StoredZone::parse(&value)
                    .ok_or_else(|| anyhow!("{} holds no usable zone", file.display()))?;
                let zone = stored.into_zone(&fallback_zone_id(&args.camera_id))?;
                stage.done_with(format!("{} ({} points)", zone.id(), zone.points().len()));
                zone
            };
            let stage = ui.stage("Save zone");
            save_zone(&mut store, &args.camera_id, &zone, surface, args.min_area)?;
            stage.done();
        }
        Command::Delete => {
            let stage = ui.stage("Delete zone");
            let removed = store.delete(&args.camera_id)?;
            stage.done_with(if removed { "removed" } else { "nothing stored" });
        }
        Command::Validate { .. } | Command::Events { .. } => {}
    }
    Ok(())
}

/// `x,y;x,y;...`
fn parse_points(raw: &str) -> Result<Vec<Point>> {
    raw.split(';')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (x, y) = pair
                .split_once(',')
                .ok_or_else(|| anyhow!("point {:?} must be x,y", pair))?;
            let x: f64 = x
                .trim()
                .parse()
                .map_err(|_| anyhow!("bad x in {:?}", pair))?;
            let y: f64 = y
                .trim()
                .parse()
                .map_err(|_| anyhow!("bad y in {:?}", pair))?;
            Ok(Point::new(x, y))
        })
        .collect()
}
