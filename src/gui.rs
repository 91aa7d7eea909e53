// src/gui.rs
use std::fs;
use std::time::Duration;

use chrono::Local;
use eframe::egui;
use egui::Color32;
use egui_plot::{Bar, BarChart, HLine, Legend, Line, LineStyle, Plot, PlotPoints, VLine};
use log::{error, info};

use crate::acquisition::plot::describe;
use crate::acquisition::{
    render_histogram_png, Acquisition, HistogramSink, LiveAggregator, LoopExit, Mode, PlotStyle,
};
use crate::config::Settings;
use crate::engine::{self, DynScope};
use crate::types::{Backend, Channel};

const PALETTE: [Color32; 4] = [
    Color32::from_rgb(80, 140, 255),
    Color32::from_rgb(255, 90, 90),
    Color32::from_rgb(90, 220, 120),
    Color32::from_rgb(240, 200, 60),
];

/// Latest bins and count axis as drawn by the bar chart.
#[derive(Clone, Debug, Default)]
pub struct HistogramView {
    bars: Vec<(f64, f64, u64)>,
    axis_max: u64,
}

impl HistogramSink for HistogramView {
    fn redraw_bins(&mut self, edges: &[f64], counts: &[u64]) {
        self.bars = counts
            .iter()
            .enumerate()
            .map(|(i, &count)| {
                let width = edges[i + 1] - edges[i];
                (edges[i] + width / 2.0, width, count)
            })
            .collect();
    }

    fn redraw_axis(&mut self, max: u64, _ticks: &[u64]) {
        self.axis_max = max;
    }
}

type Run = LiveAggregator<DynScope, HistogramView>;

pub struct ScopegateApp {
    // 配置
    settings: Settings,
    backend: Backend,
    mode: Mode,
    hist_min: f64,
    hist_max: f64,
    hist_bins: usize,

    // 采集状态
    run: Option<Run>,
    probe: Option<Acquisition>,
    show_probe: bool,

    // 界面日志
    log_messages: Vec<String>,
}

impl ScopegateApp {
    pub fn new(settings: Settings, backend: Backend) -> Self {
        Self {
            mode: settings.mode,
            hist_min: settings.histogram.min,
            hist_max: settings.histogram.max,
            hist_bins: settings.histogram.bins,
            settings,
            backend,
            run: None,
            probe: None,
            show_probe: false,
            log_messages: vec!["scopegate ready.".to_owned()],
        }
    }

    fn log(&mut self, msg: &str) {
        info!("{msg}");
        self.log_messages.push(format!("> {msg}"));
        if self.log_messages.len() > 200 {
            self.log_messages.remove(0);
        }
    }

    fn is_running(&self) -> bool {
        self.run.as_ref().is_some_and(|r| r.is_running())
    }

    /// Settings for the selected mode, borrowing channels when the file was set up for another one.
    fn effective_settings(&self) -> Settings {
        let mut s = self.settings.clone();
        s.mode = self.mode;
        s.histogram.min = self.hist_min;
        s.histogram.max = self.hist_max;
        s.histogram.bins = self.hist_bins;
        let wanted = self.mode.target_count();
        if s.targets.len() != wanted {
            s.targets = Channel::ALL[..wanted].to_vec();
            for ch in &s.targets {
                s.channels[ch.index()].enabled = true;
            }
        }
        s
    }

    fn start(&mut self) {
        let settings = self.effective_settings();
        let started = engine::open_device(self.backend)
            .and_then(|device| engine::start(&settings, device, HistogramView::default(), None));
        match started {
            Ok(run) => {
                self.run = Some(run);
                self.show_probe = false;
                self.log(&format!("▶ {} acquisition started", settings.mode));
            }
            Err(err) => self.log(&format!("❌ {err:#}")),
        }
    }

    fn stop(&mut self) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        let outcome = run.stop();
        match outcome {
            Ok(summary) => {
                let msg = match &summary.exit {
                    LoopExit::Failed(err) => format!("❌ Job finished with error: {err}"),
                    LoopExit::Cancelled | LoopExit::Completed => format!(
                        "■ Job finished: {} captures, {} timeouts",
                        summary.captured, summary.timeouts
                    ),
                };
                self.log(&msg);
            }
            Err(err) => self.log(&format!("❌ {err}")),
        }
    }

    fn probe(&mut self) {
        let settings = self.effective_settings();
        let result = engine::open_device(self.backend).and_then(|d| engine::probe(&settings, d));
        match result {
            Ok(acq) => {
                let msg = format!("🔍 Probe: {}", describe(acq.measurement.as_ref()));
                self.probe = Some(acq);
                self.show_probe = true;
                self.log(&msg);
            }
            Err(err) => self.log(&format!("❌ Probe failed: {err:#}")),
        }
    }

    fn apply_binning(&mut self) {
        let result = match self.run.as_mut() {
            Some(run) => run.rebin(self.hist_min, self.hist_max, self.hist_bins),
            None => Ok(()),
        };
        match result {
            Ok(()) => self.log(&format!(
                "Histogram: [{}, {}] in {} bins",
                self.hist_min, self.hist_max, self.hist_bins
            )),
            Err(err) => self.log(&format!("❌ {err}")),
        }
    }

    fn export_png(&mut self) {
        let Some(run) = self.run.as_ref() else {
            self.log("Nothing to export yet.");
            return;
        };
        let histogram = run.histogram();
        let png = render_histogram_png(
            &histogram.edges(),
            &histogram.counts(),
            run.axis().max(),
            self.mode.quantity(),
            PlotStyle::default(),
        );
        let dir = &self.settings.output.data_dir;
        let path = dir.join(format!(
            "{}_{}_histogram.png",
            self.settings.output.filename,
            Local::now().format("%Y-%m-%d_%H-%M-%S")
        ));
        let written = png
            .map_err(|e| e.to_string())
            .and_then(|bytes| {
                fs::create_dir_all(dir)
                    .and_then(|_| fs::write(&path, bytes))
                    .map_err(|e| e.to_string())
            });
        match written {
            Ok(()) => self.log(&format!("💾 Histogram saved to {}", path.display())),
            Err(err) => {
                error!("histogram export failed: {err}");
                self.log(&format!("❌ Export failed: {err}"));
            }
        }
    }

    fn draw_histogram(&self, ui: &mut egui::Ui) {
        let view = self.run.as_ref().map(|r| r.sink().clone()).unwrap_or_default();
        let entries = self.run.as_ref().map(|r| r.received()).unwrap_or(0);
        ui.label(format!("{entries} entries"));
        let bars: Vec<Bar> = view
            .bars
            .iter()
            .map(|&(centre, width, count)| Bar::new(centre, count as f64).width(width))
            .collect();
        let chart = BarChart::new(bars).color(PALETTE[0]).name(self.mode.quantity());
        Plot::new("histogram")
            .x_axis_label(self.mode.quantity())
            .y_axis_label("counts")
            .include_x(self.hist_min)
            .include_x(self.hist_max)
            .include_y(0.0)
            .include_y(view.axis_max.max(1) as f64)
            .allow_drag(false)
            .allow_zoom(false)
            .allow_scroll(false)
            .show(ui, |plot_ui| plot_ui.bar_chart(chart));
    }

    fn draw_probe(&self, ui: &mut egui::Ui, probe: &Acquisition) {
        ui.label(describe(probe.measurement.as_ref()));
        Plot::new("probe")
            .legend(Legend::default())
            .x_axis_label("time (ns)")
            .y_axis_label("mV")
            .show(ui, |plot_ui| {
                for (idx, wave) in probe.waveforms.iter().enumerate() {
                    let color = PALETTE[idx % PALETTE.len()];
                    let points: PlotPoints = wave
                        .times()
                        .into_iter()
                        .zip(wave.values.iter().copied())
                        .map(|(t, v)| [t, v])
                        .collect();
                    plot_ui.line(Line::new(points).color(color).name(format!("Ch {}", wave.channel)));
                    for (_, gate) in probe.gates.iter().filter(|(ch, _)| *ch == wave.channel) {
                        for time in [gate.open.time(), gate.closed.time()].into_iter().flatten() {
                            plot_ui.vline(VLine::new(time).color(color).style(LineStyle::dashed_loose()));
                        }
                    }
                }
                for threshold in &probe.thresholds {
                    plot_ui.hline(HLine::new(threshold.millivolts).color(Color32::GRAY));
                }
            });
    }
}

impl eframe::App for ScopegateApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        // 1. 排空传输队列 (不阻塞)
        if let Some(run) = self.run.as_mut() {
            run.poll();
            if run.is_running() && run.should_stop() {
                self.stop();
            }
        }
        if self.is_running() {
            ctx.request_repaint_after(Duration::from_millis(50));
        }

        // 2. UI 绘制
        let running = self.is_running();
        egui::SidePanel::left("controls").min_width(260.0).show(ctx, |ui| {
            ui.add_space(10.0);
            ui.heading("scopegate");
            ui.label(match self.backend {
                Backend::Simulated => "Simulated digitizer",
                Backend::PicoScope => "PicoScope (psospa)",
            });
            ui.separator();

            ui.add_enabled_ui(!running, |ui| {
                egui::ComboBox::from_label("Mode")
                    .selected_text(self.mode.label())
                    .show_ui(ui, |ui| {
                        for mode in Mode::ALL {
                            ui.selectable_value(&mut self.mode, mode, mode.label());
                        }
                    });
            });

            ui.horizontal(|ui| {
                if running {
                    if ui.button("⏹ STOP").clicked() {
                        self.stop();
                    }
                } else if ui.button("▶ START").clicked() {
                    self.start();
                }
                if ui.add_enabled(!running, egui::Button::new("🔍 PROBE")).clicked() {
                    self.probe();
                }
            });

            ui.separator();
            ui.label("Histogram");
            egui::Grid::new("binning").num_columns(2).show(ui, |ui| {
                ui.label("min");
                ui.add(egui::DragValue::new(&mut self.hist_min).speed(1.0));
                ui.end_row();
                ui.label("max");
                ui.add(egui::DragValue::new(&mut self.hist_max).speed(1.0));
                ui.end_row();
                ui.label("bins");
                ui.add(egui::DragValue::new(&mut self.hist_bins).clamp_range(1..=10_000));
                ui.end_row();
            });
            ui.horizontal(|ui| {
                if ui.button("Apply").clicked() {
                    self.apply_binning();
                }
                if ui.button("Export PNG").clicked() {
                    self.export_png();
                }
            });
            if self.probe.is_some() {
                ui.checkbox(&mut self.show_probe, "Show probe");
            }

            ui.separator();
            ui.label("Log");
            egui::ScrollArea::vertical()
                .stick_to_bottom(true)
                .show(ui, |ui| {
                    for line in &self.log_messages {
                        ui.monospace(line);
                    }
                });
        });

        egui::CentralPanel::default().show(ctx, |ui| match (&self.probe, self.show_probe) {
            (Some(probe), true) => self.draw_probe(ui, probe),
            _ => self.draw_histogram(ui),
        });
    }
}
