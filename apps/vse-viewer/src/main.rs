//! VSE scene viewer
//!
//! Loads a glTF 2.0 or GLB file and renders it with an orbit camera.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p vse-viewer -- [OPTIONS] <SCENE>
//! ```
//!
//! ## Controls
//!
//! - Arrow keys: orbit around the scene
//! - `+` / `-`: zoom
//! - `R`: reload the scene in the background
//! - `C`: clear the scene
//! - Drop a `.gltf` or `.glb` file on the window to open it
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use vse_app::{run_app, AppConfig};

use crate::app::{Viewer, ViewerArgs};

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    let args = ViewerArgs::from_args();
    let mut config = AppConfig::new("VSE Viewer")
        .with_size(args.width, args.height)
        .with_vsync(!args.no_vsync);
    if let Some(fps) = args.target_fps {
        config = config.with_target_fps(fps);
    }
    run_app::<Viewer>(config)
}

fn print_help() {
    eprintln!(
        "VSE scene viewer

USAGE:
    cargo run -p vse-viewer -- [OPTIONS] <SCENE>

OPTIONS:
    --width <N>         Window width (default: 1280)
    --height <N>        Window height (default: 720)
    --fps <N>           Frame rate cap (default: none)
    --no-vsync          Present without waiting for vertical blank
    --async             Parse the scene in the background after the window opens
    -h, --help          Print this help message

CONTROLS:
    Arrow keys          Orbit
    + / -               Zoom
    R                   Reload the scene
    C                   Clear the scene

ENVIRONMENT VARIABLES:
    RUST_LOG            Set log level (e.g., info, debug, trace)"
    );
}
