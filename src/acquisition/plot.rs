use std::io::Cursor;

use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use plotters::prelude::*;

use crate::acquisition::error::AcquisitionError;
use crate::acquisition::measurement::Measurement;
use crate::acquisition::session::Acquisition;

/// Colours and labels of the exported probe and histogram charts.
#[derive(Clone, Debug)]
pub struct PlotStyle {
    pub width: u32,
    pub height: u32,
    pub background: RGBColor,
    pub foreground: RGBColor,
    /// One trace colour per input channel, A to D.
    pub traces: [RGBColor; 4],
    pub threshold: RGBColor,
    pub bar: RGBColor,
    pub time_label: String,
    pub voltage_label: String,
    pub count_label: String,
}

impl Default for PlotStyle {
    fn default() -> Self {
        Self {
            width: 1000,
            height: 500,
            background: RGBColor(16, 18, 24),
            foreground: RGBColor(220, 220, 220),
            traces: [
                RGBColor(80, 140, 255),
                RGBColor(255, 90, 90),
                RGBColor(90, 220, 120),
                RGBColor(240, 200, 60),
            ],
            threshold: RGBColor(160, 160, 160),
            bar: RGBColor(80, 140, 255),
            time_label: "time (ns)".to_owned(),
            voltage_label: "mV".to_owned(),
            count_label: "counts".to_owned(),
        }
    }
}

impl PlotStyle {
    fn font(&self, size: u32) -> TextStyle<'static> {
        ("sans-serif", size).into_font().color(&self.foreground)
    }
}

pub fn describe(measurement: Option<&Measurement>) -> String {
    match measurement {
        Some(Measurement::Charge {
            value,
            amplitude,
            peak_to_peak,
        }) => format!(
            "charge {value:.3} pC, amplitude {amplitude:.1} mV, peak2peak {peak_to_peak:.1} mV"
        ),
        Some(Measurement::TimeDifference { value }) => format!("deltaT {value:.3} ns"),
        Some(Measurement::MeanDelay { value }) => format!("mean deltaT {value:.3} ns"),
        None => "no threshold crossing".to_owned(),
    }
}

/// Traces of one probe capture with threshold levels and dashed gate edges.
pub fn render_probe_png(probe: &Acquisition, style: PlotStyle) -> Result<Vec<u8>, AcquisitionError> {
    let Some(first) = probe.waveforms.iter().find(|w| !w.is_empty()) else {
        return Err(AcquisitionError::Plot("probe capture has no samples".into()));
    };
    let t_max = probe
        .waveforms
        .iter()
        .map(|w| w.duration_ns())
        .fold(first.duration_ns(), f64::max)
        .max(f64::EPSILON);
    let mut y_min = probe
        .waveforms
        .iter()
        .map(|w| w.min())
        .chain(probe.thresholds.iter().map(|t| t.millivolts))
        .fold(0.0f64, f64::min);
    let mut y_max = probe
        .waveforms
        .iter()
        .map(|w| w.max())
        .fold(0.0f64, f64::max);
    if (y_max - y_min).abs() < f64::EPSILON {
        y_min = -50.0;
        y_max = 50.0;
    }
    let pad = (y_max - y_min) * 0.05;

    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height))
            .into_drawing_area();
        root.fill(&style.background)?;
        let mut chart = ChartBuilder::on(&root)
            .margin(10)
            .caption(
                describe(probe.measurement.as_ref()),
                style.font(20),
            )
            .set_label_area_size(LabelAreaPosition::Left, 55)
            .set_label_area_size(LabelAreaPosition::Bottom, 40)
            .build_cartesian_2d(0f64..t_max, (y_min - pad)..(y_max + pad))?;
        chart
            .configure_mesh()
            .x_desc(style.time_label.as_str())
            .y_desc(style.voltage_label.as_str())
            .axis_desc_style(style.font(14))
            .label_style(style.font(12))
            .light_line_style(&style.foreground.mix(0.1))
            .draw()?;

        for wave in &probe.waveforms {
            let color = style.traces[wave.channel.index()];
            let series = wave
                .times()
                .into_iter()
                .zip(wave.values.iter().copied());
            chart
                .draw_series(LineSeries::new(series, &color))?
                .label(format!("Ch {}", wave.channel))
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &color));

            for (_, gate) in probe.gates.iter().filter(|(ch, _)| *ch == wave.channel) {
                for time in [gate.open.time(), gate.closed.time()].into_iter().flatten() {
                    chart.draw_series(DashedLineSeries::new(
                        vec![(time, y_min - pad), (time, y_max + pad)],
                        6,
                        4,
                        color.mix(0.8).stroke_width(1),
                    ))?;
                }
            }
        }
        for threshold in &probe.thresholds {
            chart.draw_series(LineSeries::new(
                vec![(0.0, threshold.millivolts), (t_max, threshold.millivolts)],
                &style.threshold,
            ))?;
        }
        chart
            .configure_series_labels()
            .border_style(&style.foreground.mix(0.2))
            .background_style(&style.background)
            .label_font(style.font(12))
            .draw()?;
        root.present()?;
    }
    encode_png(buffer, style.width, style.height)
}

/// Bar chart of `counts` over `edges`, with the count axis fixed at `axis_max`.
pub fn render_histogram_png(
    edges: &[f64],
    counts: &[u64],
    axis_max: u64,
    x_label: &str,
    style: PlotStyle,
) -> Result<Vec<u8>, AcquisitionError> {
    if counts.is_empty() || edges.len() != counts.len() + 1 {
        return Err(AcquisitionError::Plot(format!(
            "{} edges do not bound {} bins",
            edges.len(),
            counts.len()
        )));
    }
    let x_min = edges[0];
    let x_max = edges[edges.len() - 1];
    let y_max = axis_max.max(counts.iter().copied().max().unwrap_or(0)).max(1);
    let total: u64 = counts.iter().sum();

    let mut buffer = vec![0u8; (style.width * style.height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (style.width, style.height))
            .into_drawing_area();
        root.fill(&style.background)?;
        let mut chart = ChartBuilder::on(&root)
            .margin(10)
            .caption(
                format!("{total} entries"),
                style.font(20),
            )
            .set_label_area_size(LabelAreaPosition::Left, 45)
            .set_label_area_size(LabelAreaPosition::Bottom, 40)
            .build_cartesian_2d(x_min..x_max, 0u64..y_max)?;
        chart
            .configure_mesh()
            .x_desc(x_label)
            .y_desc(style.count_label.as_str())
            .axis_desc_style(style.font(14))
            .label_style(style.font(12))
            .light_line_style(&style.foreground.mix(0.1))
            .draw()?;
        let bar = style.bar.filled();
        chart.draw_series(counts.iter().enumerate().map(|(i, &count)| {
            Rectangle::new([(edges[i], 0), (edges[i + 1], count)], bar)
        }))?;
        root.present()?;
    }
    encode_png(buffer, style.width, style.height)
}

// RGB frame from the bitmap backend
fn encode_png(rgb: Vec<u8>, width: u32, height: u32) -> Result<Vec<u8>, AcquisitionError> {
    let image = ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, rgb)
        .ok_or_else(|| AcquisitionError::Plot(format!("frame is not {width}x{height} RGB")))?;
    let mut output = Vec::new();
    DynamicImage::ImageRgb8(image).write_to(&mut Cursor::new(&mut output), ImageFormat::Png)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::gate::detect_gate;
    use crate::acquisition::session::Threshold;
    use crate::acquisition::waveform::Waveform;
    use crate::types::Channel;

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G'];

    #[test]
    fn probe_renders_png() {
        let wave = Waveform::new(
            Channel::A,
            vec![0.0, -10.0, -20.0, -30.0, -40.0, -30.0, -20.0, -10.0, 0.0],
            0.4,
        );
        let gate = detect_gate(&wave.values, &wave.times(), -20.0);
        let probe = Acquisition {
            waveforms: vec![wave],
            gates: vec![(Channel::A, gate)],
            thresholds: vec![Threshold {
                channel: Channel::A,
                adc: -3251,
                millivolts: -20.0,
            }],
            measurement: None,
        };
        let png = render_probe_png(&probe, PlotStyle::default()).unwrap();
        assert!(png.starts_with(PNG_MAGIC));
    }

    #[test]
    fn histogram_renders_png_and_rejects_mismatched_edges() {
        let png = render_histogram_png(&[0.0, 1.0, 2.0], &[3, 7], 50, "charge (pC)", PlotStyle::default())
            .unwrap();
        assert!(png.starts_with(PNG_MAGIC));
        assert!(render_histogram_png(&[0.0, 1.0], &[3, 7], 50, "x", PlotStyle::default()).is_err());
    }

    #[test]
    fn histogram_honours_custom_style() {
        let style = PlotStyle {
            width: 320,
            height: 200,
            bar: RGBColor(255, 0, 0),
            count_label: "events".to_owned(),
            ..PlotStyle::default()
        };
        let png = render_histogram_png(&[0.0, 5.0, 10.0], &[0, 12], 50, "deltaT (ns)", style).unwrap();
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (320, 200));
    }

    #[test]
    fn empty_probe_is_an_error() {
        let probe = Acquisition {
            waveforms: vec![],
            gates: vec![],
            thresholds: vec![],
            measurement: None,
        };
        assert!(matches!(
            render_probe_png(&probe, PlotStyle::default()),
            Err(AcquisitionError::Plot(_))
        ));
    }
}
