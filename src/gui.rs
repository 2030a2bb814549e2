//! Native viewer using egui
//!
//! Draws the point cloud with software projection, handles orbit controls
//! and point picking, and drives segmentation requests from a side panel.
//! Network calls run on the tokio runtime and report back over a channel
//! drained at the start of every frame.

use eframe::egui;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;
use three_d::{InnerSpace, Mat4, SquareMatrix};
use tracing::{debug, info};

use crate::api::{ApiClient, ApiError, SegmentationResponse};
use crate::bvh::CachedIndex;
use crate::camera::{fit_camera_to_points, AutoFit, FitOptions, PerspectiveCamera, Viewport};
use crate::cloud::PointCloudBuffer;
use crate::config::Config;
use crate::picker::{pick, ClickTracker, PickConfig, PickHit};
use crate::selection::PointLabel;
use crate::session::{Pending, SegmentationSession, SessionError};

/// Run the native viewer. Without `initial` the cloud is fetched from the API.
pub fn run_viewer(
    config: Config,
    client: ApiClient,
    runtime: tokio::runtime::Handle,
    initial: Option<PointCloudBuffer>,
) -> anyhow::Result<()> {
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([1200.0, 800.0])
            .with_title("Point Cloud Segmentation"),
        ..Default::default()
    };

    eframe::run_native(
        "Point Cloud Segmentation",
        options,
        Box::new(|cc| Ok(Box::new(SegmentationApp::new(cc, config, client, runtime, initial)))),
    )
    .map_err(|e| anyhow::anyhow!("GUI error: {}", e))
}

/// Result of a background request
enum Completion {
    PointCloud(Result<PointCloudBuffer, ApiError>),
    Segmentation(Result<SegmentationResponse, ApiError>),
}

#[derive(Clone, Copy)]
enum NoticeKind {
    Info,
    Success,
    Warning,
    Error,
}

impl NoticeKind {
    fn color(self) -> egui::Color32 {
        match self {
            NoticeKind::Info => egui::Color32::LIGHT_BLUE,
            NoticeKind::Success => egui::Color32::LIGHT_GREEN,
            NoticeKind::Warning => egui::Color32::YELLOW,
            NoticeKind::Error => egui::Color32::LIGHT_RED,
        }
    }
}

/// Transient message shown in the corner of the view
struct Notice {
    kind: NoticeKind,
    text: String,
    expires_at: f64,
}

struct SegmentationApp {
    config: Config,
    session: SegmentationSession,
    client: ApiClient,
    runtime: tokio::runtime::Handle,
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
    // View
    camera: PerspectiveCamera,
    fit_options: FitOptions,
    auto_fit: AutoFit,
    index: Option<CachedIndex>,
    pick_config: PickConfig,
    clicks: ClickTracker,
    hover: Option<PickHit>,
    notices: Vec<Notice>,
}

impl SegmentationApp {
    fn new(
        cc: &eframe::CreationContext<'_>,
        config: Config,
        client: ApiClient,
        runtime: tokio::runtime::Handle,
        initial: Option<PointCloudBuffer>,
    ) -> Self {
        cc.egui_ctx.set_visuals(egui::Visuals::dark());

        let (tx, rx) = mpsc::channel();
        let camera = PerspectiveCamera {
            fov_y: config.fov(),
            ..Default::default()
        };

        let mut app = Self {
            session: SegmentationSession::new(&config),
            fit_options: config.fit_options(),
            pick_config: config.pick_config(),
            clicks: ClickTracker::new(config.picking.click_threshold_px),
            config,
            client,
            runtime,
            tx,
            rx,
            camera,
            auto_fit: AutoFit::default(),
            index: None,
            hover: None,
            notices: Vec::new(),
        };

        match initial {
            Some(buffer) => app.session.set_point_cloud(buffer),
            None => app.start_fetch(&cc.egui_ctx),
        }
        app
    }

    fn notify(&mut self, ctx: &egui::Context, kind: NoticeKind, text: impl Into<String>) {
        let now = ctx.input(|i| i.time);
        self.notices.push(Notice {
            kind,
            text: text.into(),
            expires_at: now + self.config.viewer.notice_secs as f64,
        });
    }

    fn start_fetch(&mut self, ctx: &egui::Context) {
        if let Err(e) = self.session.begin_load() {
            self.notify(ctx, NoticeKind::Warning, e.to_string());
            return;
        }
        let client = self.client.clone();
        let tx = self.tx.clone();
        let ctx = ctx.clone();
        self.runtime.spawn(async move {
            let result = client.fetch_point_cloud().await;
            let _ = tx.send(Completion::PointCloud(result));
            ctx.request_repaint();
        });
    }

    fn start_segmentation(&mut self, ctx: &egui::Context) {
        let request = match self.session.begin_segmentation() {
            Ok(request) => request,
            Err(SessionError::EmptySelection) => {
                self.notify(ctx, NoticeKind::Warning, "Please select at least one point");
                return;
            }
            Err(e) => {
                self.notify(ctx, NoticeKind::Warning, e.to_string());
                return;
            }
        };

        let client = self.client.clone();
        let tx = self.tx.clone();
        let ctx = ctx.clone();
        self.runtime.spawn(async move {
            let result = client.segment(&request).await;
            let _ = tx.send(Completion::Segmentation(result));
            ctx.request_repaint();
        });
    }

    fn drain_completions(&mut self, ctx: &egui::Context) {
        while let Ok(completion) = self.rx.try_recv() {
            match completion {
                Completion::PointCloud(result) => match self.session.finish_load(result) {
                    Ok(count) => self.notify(ctx, NoticeKind::Info, format!("Loaded {} points", count)),
                    Err(e) => self.notify(ctx, NoticeKind::Error, format!("Failed to load point cloud: {}", e)),
                },
                Completion::Segmentation(result) => match self.session.complete_segmentation(result) {
                    Ok(kept) => self.notify(
                        ctx,
                        NoticeKind::Success,
                        format!("Segmentation completed: {} points selected", kept),
                    ),
                    Err(e) => self.notify(ctx, NoticeKind::Error, format!("Segmentation failed: {}", e)),
                },
            }
        }
    }

    /// Keep the index and the camera framing in step with the session's cloud
    fn sync_geometry(&mut self) {
        let Some(cloud) = self.session.point_cloud() else {
            self.index = None;
            return;
        };
        if CachedIndex::sync(&mut self.index, cloud, self.config.viewer.point_size, Mat4::identity()) {
            debug!("Spatial index rebuilt for generation {}", self.session.generation());
        }
        self.auto_fit.apply(
            self.session.generation(),
            cloud.positions(),
            &mut self.camera,
            &self.fit_options,
        );
    }

    fn frame_cloud(&mut self) {
        if let Some(cloud) = self.session.point_cloud() {
            fit_camera_to_points(cloud.positions(), &mut self.camera, &self.fit_options);
        }
    }

    fn pick_at(&self, pos: egui::Pos2, viewport: &Viewport) -> Option<PickHit> {
        let index = self.index.as_ref()?;
        pick(pos.x, pos.y, &self.camera, viewport, index, &self.pick_config)
    }

    fn handle_click(&mut self, ctx: &egui::Context, pos: egui::Pos2, viewport: &Viewport, remove: bool) {
        let Some(hit) = self.pick_at(pos, viewport) else {
            return;
        };
        if remove {
            if let Some(removed) = self.session.remove_nearest(hit.position) {
                info!("Removed {} point {}", removed.label, removed.id);
            }
            return;
        }
        let label = self.session.selection_mode();
        let added = self.session.add_point(hit.position).map(|p| p.id.clone());
        match added {
            Some(id) => info!("Added {} point {} at index {}", label, id, hit.index),
            None => self.notify(ctx, NoticeKind::Info, "A point is already selected there"),
        }
    }

    /// Orbit, pan, zoom, and click picking inside the view rectangle
    fn handle_view_input(&mut self, ctx: &egui::Context, rect: egui::Rect, viewport: &Viewport) {
        let viewer = self.config.viewer.clone();
        let input = ctx.input(|i| {
            (
                i.pointer.interact_pos(),
                i.pointer.hover_pos(),
                i.pointer.delta(),
                i.pointer.primary_pressed(),
                i.pointer.primary_released(),
                i.pointer.primary_down(),
                i.pointer.secondary_down() || i.pointer.middle_down(),
                i.raw_scroll_delta.y,
                i.modifiers.command,
                i.key_pressed(egui::Key::F),
            )
        });
        let (interact, hover, delta, pressed, released, primary_down, pan_down, scroll, command, fit_key) = input;
        let inside = hover.is_some_and(|p| rect.contains(p));

        if fit_key {
            self.frame_cloud();
        }

        if pressed {
            match interact {
                Some(p) if rect.contains(p) => self.clicks.press(p.x, p.y),
                _ => self.clicks.cancel(),
            }
        }

        if primary_down {
            if let Some(p) = interact {
                if self.clicks.is_dragging(p.x, p.y) {
                    self.camera
                        .orbit(-delta.x * viewer.orbit_speed, -delta.y * viewer.orbit_speed);
                }
            }
        }

        if pan_down && inside {
            let distance = (self.camera.position - self.camera.target).magnitude();
            let per_pixel = self.camera.visible_height_at(distance) / viewport.height.max(1.0);
            self.camera.pan(-delta.x * per_pixel, delta.y * per_pixel);
        }

        if scroll != 0.0 && inside {
            self.camera.dolly((1.0 - scroll * viewer.zoom_speed).clamp(0.5, 2.0));
        }

        if released {
            if let Some(p) = interact {
                if self.clicks.release(p.x, p.y) {
                    self.handle_click(ctx, p, viewport, command);
                }
            }
        }

        self.hover = if self.config.picking.hover && inside && !primary_down && !pan_down {
            hover.and_then(|p| self.pick_at(p, viewport))
        } else {
            None
        };
    }

    fn draw_view(&self, painter: &egui::Painter, rect: egui::Rect, viewport: &Viewport) {
        painter.rect_filled(rect, 0.0, egui::Color32::from_gray(16));

        let Some(cloud) = self.session.point_cloud() else {
            return;
        };
        let colors = self.session.display_colors();
        let vp = self.camera.view_projection(viewport);
        let forward = self.camera.forward();

        // Back to front, nearer points painted last
        let mut projected: Vec<(f32, usize, egui::Pos2)> = Vec::with_capacity(cloud.len());
        for i in 0..cloud.len() {
            let Some(point) = cloud.position(i) else {
                continue;
            };
            if let Some((x, y)) = self.camera.project(point, &vp, viewport) {
                let pos = egui::pos2(x, y);
                if rect.contains(pos) {
                    let depth = (point - self.camera.position).dot(forward);
                    projected.push((depth, i, pos));
                }
            }
        }
        projected.sort_unstable_by(|a, b| b.0.total_cmp(&a.0));

        let size = egui::vec2(self.config.viewer.point_size, self.config.viewer.point_size);
        let mut mesh = egui::Mesh::default();
        for &(_, i, pos) in &projected {
            let color = colors
                .get(i * 3..i * 3 + 3)
                .map(|c| {
                    egui::Color32::from_rgb(
                        (c[0] * 255.0) as u8,
                        (c[1] * 255.0) as u8,
                        (c[2] * 255.0) as u8,
                    )
                })
                .unwrap_or(egui::Color32::GRAY);
            mesh.add_colored_rect(egui::Rect::from_center_size(pos, size), color);
        }
        painter.add(egui::Shape::mesh(mesh));

        let radius = self.config.viewer.marker_radius;
        for point in self.session.selection().iter() {
            if let Some((x, y)) = self.camera.project(point.position, &vp, viewport) {
                let fill = match point.label {
                    PointLabel::Positive => egui::Color32::from_rgb(82, 196, 26),
                    PointLabel::Negative => egui::Color32::from_rgb(255, 77, 79),
                };
                painter.circle(egui::pos2(x, y), radius, fill, egui::Stroke::new(1.0, egui::Color32::WHITE));
            }
        }

        if let Some(hit) = self.hover {
            if let Some((x, y)) = self.camera.project(hit.position, &vp, viewport) {
                painter.circle_stroke(
                    egui::pos2(x, y),
                    radius + 2.0,
                    egui::Stroke::new(1.5, egui::Color32::YELLOW),
                );
            }
        }
    }

    fn draw_notices(&mut self, ctx: &egui::Context) {
        let now = ctx.input(|i| i.time);
        self.notices.retain(|n| n.expires_at > now);
        if self.notices.is_empty() {
            return;
        }

        egui::Area::new(egui::Id::new("notices"))
            .anchor(egui::Align2::RIGHT_TOP, [-12.0, 12.0])
            .show(ctx, |ui| {
                egui::Frame::popup(ui.style()).show(ui, |ui| {
                    for notice in &self.notices {
                        ui.colored_label(notice.kind.color(), &notice.text);
                    }
                });
            });

        if let Some(next) = self.notices.iter().map(|n| n.expires_at).reduce(f64::min) {
            ctx.request_repaint_after(Duration::from_secs_f64((next - now).max(0.0)));
        }
    }

    fn control_panel(&mut self, ctx: &egui::Context, ui: &mut egui::Ui) {
        ui.heading("Segmentation Controls");
        ui.separator();

        ui.label(egui::RichText::new("Selection Mode").strong());
        let mut mode = self.session.selection_mode();
        ui.horizontal(|ui| {
            ui.radio_value(&mut mode, PointLabel::Positive, "Positive");
            ui.radio_value(&mut mode, PointLabel::Negative, "Negative");
        });
        if mode != self.session.selection_mode() {
            self.session.set_selection_mode(mode);
        }

        ui.separator();
        let selection = self.session.selection();
        ui.label(egui::RichText::new("Selected Points").strong());
        ui.label(format!("Positive: {}", selection.count(PointLabel::Positive)));
        ui.label(format!("Negative: {}", selection.count(PointLabel::Negative)));
        ui.label(format!("Total: {}", selection.len()));
        let has_points = !selection.is_empty();

        ui.separator();
        ui.horizontal(|ui| {
            if ui
                .add_enabled(self.session.can_segment(), egui::Button::new("Run Segmentation"))
                .clicked()
            {
                self.start_segmentation(ctx);
            }
            if self.session.is_loading() {
                ui.spinner();
            }
        });
        if ui.add_enabled(has_points, egui::Button::new("Clear All Points")).clicked() {
            self.session.clear_points();
        }
        if ui
            .add_enabled(self.session.mask().is_some(), egui::Button::new("Clear Mask"))
            .clicked()
        {
            self.session.clear_mask();
        }
        if ui.button("Reset").clicked() {
            self.session.reset();
        }

        ui.separator();
        ui.horizontal(|ui| {
            if ui.button("Frame Cloud").clicked() {
                self.frame_cloud();
            }
            let fetching = self.session.pending() == Some(Pending::PointCloud);
            if ui.add_enabled(!self.session.is_loading(), egui::Button::new("Reload")).clicked() {
                self.start_fetch(ctx);
            }
            if fetching {
                ui.label("Loading...");
            }
        });

        ui.separator();
        let mut to_remove: Option<String> = None;
        egui::ScrollArea::vertical().max_height(240.0).show(ui, |ui| {
            for point in self.session.selection().iter() {
                ui.horizontal(|ui| {
                    let color = match point.label {
                        PointLabel::Positive => egui::Color32::LIGHT_GREEN,
                        PointLabel::Negative => egui::Color32::LIGHT_RED,
                    };
                    ui.colored_label(color, "●");
                    ui.label(format!(
                        "({:.3}, {:.3}, {:.3})",
                        point.position.x, point.position.y, point.position.z
                    ));
                    if ui.small_button("✖").clicked() {
                        to_remove = Some(point.id.clone());
                    }
                });
            }
        });
        if let Some(id) = to_remove {
            self.session.remove_point(&id);
        }

        ui.separator();
        if let Some(hit) = self.hover {
            ui.label(format!(
                "Hover: #{} ({:.3}, {:.3}, {:.3})",
                hit.index, hit.position.x, hit.position.y, hit.position.z
            ));
        }
        if let Some(index) = &self.index {
            let stats = index.bvh().stats();
            ui.label(format!("{} points, {} nodes", stats.primitive_count, stats.node_count));
        }

        ui.separator();
        ui.label(egui::RichText::new("Instructions").strong());
        ui.small("1. Pick a mode (Positive/Negative)");
        ui.small("2. Click points in the 3D view");
        ui.small("3. Run segmentation once enough points are selected");
        ui.small("Ctrl/Cmd-click removes the nearest selected point");
        ui.small("Left-drag: orbit | Right/Middle-drag: pan | Scroll: zoom | F: frame");
    }
}

impl eframe::App for SegmentationApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.drain_completions(ctx);
        self.sync_geometry();

        egui::SidePanel::left("controls_panel")
            .default_width(260.0)
            .show(ctx, |ui| {
                self.control_panel(ctx, ui);
            });

        egui::CentralPanel::default()
            .frame(egui::Frame::none())
            .show(ctx, |ui| {
                let (response, painter) = ui.allocate_painter(ui.available_size(), egui::Sense::click_and_drag());
                let rect = response.rect;
                let viewport = Viewport::new(rect.min.x, rect.min.y, rect.width(), rect.height());
                if viewport.width <= 0.0 || viewport.height <= 0.0 {
                    return;
                }

                self.handle_view_input(ctx, rect, &viewport);
                self.draw_view(&painter, rect, &viewport);
            });

        self.draw_notices(ctx);
    }
}
