//! Viewer application: one scene and an orbit camera.

use std::collections::HashSet;
use std::path::PathBuf;

use glam::Vec3;
use tracing::{error, info, warn};
use winit::event::ElementState;
use winit::keyboard::{KeyCode, PhysicalKey};

use vse_app::{AppContext, AttachedScene, SceneApp, WindowEvent};

/// Orbit speed in radians per second.
const ORBIT_SPEED: f32 = 1.5;

/// Zoom rate as a fraction of the distance per second.
const ZOOM_SPEED: f32 = 1.0;

const MAX_PITCH: f32 = 1.5;

/// Command line options.
#[derive(Debug, Clone)]
pub struct ViewerArgs {
    pub scene: Option<PathBuf>,
    pub width: u32,
    pub height: u32,
    pub target_fps: Option<u32>,
    pub no_vsync: bool,
    pub background: bool,
}

impl Default for ViewerArgs {
    fn default() -> Self {
        Self {
            scene: None,
            width: 1280,
            height: 720,
            target_fps: None,
            no_vsync: false,
            background: false,
        }
    }
}

impl ViewerArgs {
    pub fn from_args() -> Self {
        Self::parse(std::env::args().skip(1))
    }

    fn parse(args: impl IntoIterator<Item = String>) -> Self {
        let mut parsed = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--width" => {
                    if let Some(v) = args.next().and_then(|v| v.parse().ok()) {
                        parsed.width = v;
                    }
                }
                "--height" => {
                    if let Some(v) = args.next().and_then(|v| v.parse().ok()) {
                        parsed.height = v;
                    }
                }
                "--fps" => parsed.target_fps = args.next().and_then(|v| v.parse().ok()),
                "--no-vsync" => parsed.no_vsync = true,
                "--async" => parsed.background = true,
                other if other.starts_with('-') => warn!("Ignoring unknown option {other}"),
                other => parsed.scene = Some(PathBuf::from(other)),
            }
        }
        parsed
    }
}

#[derive(Debug, Clone, Copy)]
struct Orbit {
    target: Vec3,
    distance: f32,
    radius: f32,
    yaw: f32,
    pitch: f32,
}

impl Orbit {
    fn around(center: Vec3, radius: f32, eye: Vec3) -> Self {
        let offset = eye - center;
        let distance = offset.length().max(0.01);
        let dir = offset / distance;
        Self {
            target: center,
            distance,
            radius: radius.max(0.01),
            yaw: dir.x.atan2(dir.z),
            pitch: dir.y.clamp(-1.0, 1.0).asin(),
        }
    }

    fn eye(&self) -> Vec3 {
        let (sin_yaw, cos_yaw) = self.yaw.sin_cos();
        let (sin_pitch, cos_pitch) = self.pitch.sin_cos();
        self.target + Vec3::new(sin_yaw * cos_pitch, sin_pitch, cos_yaw * cos_pitch) * self.distance
    }
}

pub struct Viewer {
    scene: Option<PathBuf>,
    orbit: Option<Orbit>,
    pressed: HashSet<KeyCode>,
}

impl SceneApp for Viewer {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        let args = ViewerArgs::from_args();
        let mut viewer = Self {
            scene: args.scene.clone(),
            orbit: None,
            pressed: HashSet::new(),
        };

        match &args.scene {
            Some(path) if args.background => ctx.begin_load(path.clone()),
            Some(path) => {
                let attached = ctx.load_scene(path)?;
                viewer.reset_orbit(ctx, &attached);
            }
            None => info!("No scene given; drop a glTF file on the window"),
        }
        Ok(viewer)
    }

    fn update(&mut self, ctx: &mut AppContext, dt: f32) {
        let Some(orbit) = &mut self.orbit else {
            return;
        };
        let axis = |positive: KeyCode, negative: KeyCode| {
            f32::from(u8::from(self.pressed.contains(&positive)))
                - f32::from(u8::from(self.pressed.contains(&negative)))
        };
        let yaw = axis(KeyCode::ArrowRight, KeyCode::ArrowLeft);
        let pitch = axis(KeyCode::ArrowUp, KeyCode::ArrowDown);
        let zoom = axis(KeyCode::Minus, KeyCode::Equal);

        orbit.yaw += yaw * ORBIT_SPEED * dt;
        orbit.pitch = (orbit.pitch + pitch * ORBIT_SPEED * dt).clamp(-MAX_PITCH, MAX_PITCH);
        orbit.distance = (orbit.distance * (1.0 + zoom * ZOOM_SPEED * dt)).max(0.01);

        let camera = &mut ctx.camera;
        camera.position = orbit.eye();
        camera.look_at(orbit.target);
        camera.near = (orbit.distance - orbit.radius).max(orbit.distance * 0.001);
        camera.far = orbit.distance + orbit.radius * 2.0;
    }

    fn on_scene_loaded(&mut self, ctx: &mut AppContext, result: anyhow::Result<AttachedScene>) {
        match result {
            Ok(attached) => self.reset_orbit(ctx, &attached),
            Err(e) => error!("Scene load failed: {e:#}"),
        }
    }

    fn on_event(&mut self, ctx: &mut AppContext, event: &WindowEvent) -> bool {
        match event {
            WindowEvent::KeyboardInput { event, .. } => {
                let PhysicalKey::Code(code) = event.physical_key else {
                    return false;
                };
                match event.state {
                    ElementState::Pressed => {
                        if !event.repeat {
                            self.on_key(ctx, code);
                        }
                        self.pressed.insert(code);
                    }
                    ElementState::Released => {
                        self.pressed.remove(&code);
                    }
                }
                true
            }
            WindowEvent::DroppedFile(path) => {
                ctx.clear_scene();
                self.scene = Some(path.clone());
                ctx.begin_load(path.clone());
                true
            }
            _ => false,
        }
    }

    fn cleanup(&mut self, ctx: &mut AppContext) {
        let stats = ctx.registry.stats();
        info!(
            "Viewer shutting down with {} meshes, {} materials, {} textures resident",
            stats.meshes, stats.materials, stats.textures
        );
    }
}

impl Viewer {
    fn on_key(&mut self, ctx: &mut AppContext, code: KeyCode) {
        match code {
            KeyCode::KeyR => {
                if let Some(path) = self.scene.clone() {
                    ctx.clear_scene();
                    ctx.begin_load(path);
                }
            }
            KeyCode::KeyC => {
                ctx.clear_scene();
                self.orbit = None;
                info!("Scene cleared");
            }
            _ => {}
        }
    }

    fn reset_orbit(&mut self, ctx: &AppContext, attached: &AttachedScene) {
        self.orbit = attached
            .bounds
            .as_ref()
            .map(|b| Orbit::around(b.center(), b.size().length() * 0.5, ctx.camera.position));
    }
}
