//! cloud_seg - interactive point cloud segmentation
//!
//! CLI commands:
//! - gui: Launch the native viewer
//! - fetch: Download the point cloud and report its stats
//! - segment: Send seed points to the segmentation service
//! - fit: Print the camera framing for a point cloud

mod api;
mod bvh;
mod camera;
mod cloud;
mod config;
mod gui;
mod logging;
mod overlay;
mod picker;
mod selection;
mod session;

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use three_d::vec3;

use crate::api::ApiClient;
use crate::camera::{fit_camera_to_points, PerspectiveCamera};
use crate::cloud::PointCloudBuffer;
use crate::selection::PointLabel;
use crate::session::{SegmentationSession, SessionError};

#[derive(Parser)]
#[command(name = "cloud_seg")]
#[command(about = "Pick seed points on a 3D point cloud and segment it")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to cloud_seg.yaml config
    #[arg(short, long, default_value = "cloud_seg.yaml", global = true)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch native viewer
    Gui {
        /// Load the point cloud from a JSON file instead of the API
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Fetch the point cloud from the API
    Fetch {
        /// Save the response as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run segmentation for the given seed points
    Segment {
        /// Point cloud JSON used to validate the mask length
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Positive seed as X,Y,Z (repeatable)
        #[arg(long, value_parser = parse_point)]
        positive: Vec<[f32; 3]>,

        /// Negative seed as X,Y,Z (repeatable)
        #[arg(long, value_parser = parse_point)]
        negative: Vec<[f32; 3]>,
    },

    /// Print the auto-fit camera for a point cloud
    Fit {
        /// Load the point cloud from a JSON file instead of the API
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = config::Settings::load();

    // Initialize logging first
    logging::init_logging(&settings.log_dir)?;
    tracing::info!("cloud_seg starting up");

    let cli = Cli::parse();
    tracing::debug!("CLI args parsed: config={:?}", cli.config);

    let config = config::Config::load_or_default(&cli.config)?;
    let client = ApiClient::new(&settings.api_base_url, settings.api_timeout)?;
    tracing::info!("API base URL: {}", client.base_url());

    match cli.command {
        Commands::Gui { file } => {
            let initial = match file {
                Some(path) => Some(api::load_point_cloud_file(&path)?),
                None => None,
            };
            tracing::info!("Launching native viewer");
            gui::run_viewer(config, client, tokio::runtime::Handle::current(), initial)?;
        }

        Commands::Fetch { output } => {
            let buffer = client.fetch_point_cloud().await?;
            print_stats(&buffer);
            if let Some(path) = output {
                api::save_point_cloud_file(&path, &buffer)?;
                println!("Saved to {:?}", path);
            }
        }

        Commands::Segment {
            file,
            positive,
            negative,
        } => {
            segment(&config, &client, file.as_deref(), &positive, &negative).await?;
        }

        Commands::Fit { file } => {
            let buffer = load_cloud(&client, file.as_deref()).await?;
            let mut camera = PerspectiveCamera {
                fov_y: config.fov(),
                ..Default::default()
            };
            match fit_camera_to_points(buffer.positions(), &mut camera, &config.fit_options()) {
                Some(fit) => {
                    println!("Center:   ({:.4}, {:.4}, {:.4})", fit.center.x, fit.center.y, fit.center.z);
                    println!("Size:     ({:.4}, {:.4}, {:.4})", fit.size.x, fit.size.y, fit.size.z);
                    println!("Distance: {:.4}", fit.distance);
                    println!(
                        "Camera:   ({:.4}, {:.4}, {:.4})",
                        fit.camera_position.x, fit.camera_position.y, fit.camera_position.z
                    );
                }
                None => println!("Point cloud is empty, nothing to fit"),
            }
        }
    }

    Ok(())
}

/// Parse "X,Y,Z" into a point
fn parse_point(s: &str) -> Result<[f32; 3], String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    if parts.len() != 3 {
        return Err(format!("expected X,Y,Z but got '{}'", s));
    }
    let mut point = [0.0f32; 3];
    for (slot, part) in point.iter_mut().zip(&parts) {
        *slot = part
            .parse()
            .map_err(|e| format!("invalid coordinate '{}': {}", part, e))?;
        if !slot.is_finite() {
            return Err(format!("coordinate '{}' is not finite", part));
        }
    }
    Ok(point)
}

async fn load_cloud(client: &ApiClient, file: Option<&Path>) -> anyhow::Result<PointCloudBuffer> {
    match file {
        Some(path) => api::load_point_cloud_file(path),
        None => Ok(client.fetch_point_cloud().await?),
    }
}

fn print_stats(buffer: &PointCloudBuffer) {
    println!("Points: {}", buffer.len());
    if !buffer.is_well_formed() {
        println!(
            "Malformed buffer: {} position values, {} color values",
            buffer.positions().len(),
            buffer.colors().len()
        );
        return;
    }
    match buffer.bounds() {
        Some(bounds) => {
            println!("Min: ({:.4}, {:.4}, {:.4})", bounds.min.x, bounds.min.y, bounds.min.z);
            println!("Max: ({:.4}, {:.4}, {:.4})", bounds.max.x, bounds.max.y, bounds.max.z);
        }
        None => println!("No finite points"),
    }
}

/// Send seeds through a session so the same dedupe and validation apply
async fn segment(
    config: &config::Config,
    client: &ApiClient,
    file: Option<&Path>,
    positive: &[[f32; 3]],
    negative: &[[f32; 3]],
) -> anyhow::Result<()> {
    let mut session = SegmentationSession::new(config);
    if let Some(path) = file {
        session.set_point_cloud(api::load_point_cloud_file(path)?);
    }

    for (label, points) in [(PointLabel::Positive, positive), (PointLabel::Negative, negative)] {
        session.set_selection_mode(label);
        for p in points {
            if session.add_point(vec3(p[0], p[1], p[2])).is_none() {
                println!("Skipped {} seed {:?}: too close to another seed", label, p);
            }
        }
    }

    let request = session.begin_segmentation()?;
    println!("Sending {} seed points", request.len());

    let result = client.segment(&request).await;
    let mask_stats = result
        .as_ref()
        .ok()
        .map(|r| (r.mask.len(), r.mask.iter().filter(|&&m| m != 0).count()));

    match session.complete_segmentation(result) {
        Ok(kept) => {
            let total = session.mask().map_or(0, |m| m.len());
            println!("Mask applied: {} of {} points inside", kept, total);
        }
        Err(SessionError::NoPointCloud) => {
            if let Some((len, inside)) = mask_stats {
                println!("Mask of {} values, {} inside (no point cloud to validate against)", len, inside);
            }
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
