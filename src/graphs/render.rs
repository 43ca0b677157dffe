//! SVG chart generation and PNG rasterization.
//!
//! Charts are plain generated SVG rasterized through resvg. Rendering is
//! synchronous and CPU-bound; callers run it through the task runner, never
//! directly on the event loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use fontdb::Database;
use tracing::{debug, info};

use super::data::{PlayHistory, RankedSeries, SplitSeries};
use super::runner::RenderError;
use super::ChartKind;

const CANVAS_WIDTH: f32 = 800.0;
const CANVAS_HEIGHT: f32 = 500.0;
const MARGIN_TOP: f32 = 60.0;
const MARGIN_BOTTOM: f32 = 90.0;
const MARGIN_RIGHT: f32 = 30.0;
const MARGIN_LEFT: f32 = 70.0;
// Ranked charts put names on the left axis and need the extra room.
const MARGIN_LEFT_RANKED: f32 = 170.0;
const Y_TICKS: u32 = 5;
const TOP_N: usize = 10;

const BACKGROUND: &str = "#ffffff";
const AXIS_COLOR: &str = "#333333";
const GRID_COLOR: &str = "#dddddd";
const TEXT_COLOR: &str = "#222222";

pub struct ChartRenderer {
    output_dir: PathBuf,
    tv_color: String,
    movie_color: String,
    censor_usernames: bool,
    fontdb: Arc<Database>,
}

impl ChartRenderer {
    /// Create a renderer writing PNGs into `output_dir`. System fonts are
    /// loaded once and shared across renders.
    pub fn new(
        output_dir: impl AsRef<Path>,
        tv_color: impl Into<String>,
        movie_color: impl Into<String>,
        censor_usernames: bool,
    ) -> Self {
        let mut fontdb = Database::new();
        fontdb.load_system_fonts();
        debug!("loaded {} font faces for chart rendering", fontdb.len());

        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            tv_color: tv_color.into(),
            movie_color: movie_color.into(),
            censor_usernames,
            fontdb: Arc::new(fontdb),
        }
    }

    /// Render one chart over the whole server's history.
    pub fn render(&self, chart: ChartKind, history: &PlayHistory) -> Result<PathBuf, RenderError> {
        self.render_with_stem(chart, history, chart.as_str())
    }

    /// Render one chart over a single user's history, named so files from
    /// different users cannot collide.
    pub fn render_for_user(
        &self,
        chart: ChartKind,
        user_id: u64,
        history: &PlayHistory,
    ) -> Result<PathBuf, RenderError> {
        let stem = format!("user_{user_id}_{}", chart.as_str());
        self.render_with_stem(chart, history, &stem)
    }

    fn render_with_stem(
        &self,
        chart: ChartKind,
        history: &PlayHistory,
        stem: &str,
    ) -> Result<PathBuf, RenderError> {
        let svg = self.generate_svg(chart, history)?;

        std::fs::create_dir_all(&self.output_dir).map_err(|e| {
            RenderError::unexpected(format!(
                "could not create {}: {e}",
                self.output_dir.display()
            ))
        })?;

        let filename = format!("{stem}_{}.png", Utc::now().format("%Y%m%d_%H%M%S"));
        let output_path = self.output_dir.join(filename);
        self.rasterize(&svg, &output_path)?;

        info!("rendered {chart} to {}", output_path.display());
        Ok(output_path)
    }

    fn generate_svg(&self, chart: ChartKind, history: &PlayHistory) -> Result<String, RenderError> {
        match chart {
            ChartKind::DailyPlayCount => {
                self.split_chart(chart, history, history.daily_play_counts())
            }
            ChartKind::PlayCountByDayofweek => {
                self.split_chart(chart, history, history.plays_by_weekday())
            }
            ChartKind::PlayCountByHourofday => {
                self.split_chart(chart, history, history.plays_by_hour())
            }
            ChartKind::PlayCountByMonth => {
                self.split_chart(chart, history, history.plays_by_month())
            }
            ChartKind::Top10Platforms => {
                self.ranked_chart(chart, history, history.top_platforms(TOP_N))
            }
            ChartKind::Top10Users => self.ranked_chart(
                chart,
                history,
                history.top_users(TOP_N, self.censor_usernames),
            ),
        }
    }

    /// Stacked vertical bars, movies below TV, one bar per label.
    fn split_chart(
        &self,
        chart: ChartKind,
        history: &PlayHistory,
        series: SplitSeries,
    ) -> Result<String, RenderError> {
        if series.total() == 0 {
            return Err(RenderError::expected(format!(
                "no plays in the last {} days for {chart}",
                history.range_days
            )));
        }

        let plot_w = CANVAS_WIDTH - MARGIN_LEFT - MARGIN_RIGHT;
        let plot_h = CANVAS_HEIGHT - MARGIN_TOP - MARGIN_BOTTOM;
        let bottom = MARGIN_TOP + plot_h;

        let peak = series
            .movies
            .iter()
            .zip(&series.tv)
            .map(|(m, t)| m + t)
            .max()
            .unwrap_or(0);
        let axis_max = nice_axis_max(peak);

        let mut body = String::new();
        self.push_grid(&mut body, axis_max, MARGIN_LEFT, plot_w, plot_h);

        let n = series.labels.len();
        let slot = plot_w / n as f32;
        let bar_w = slot * 0.7;
        let label_every = n.div_ceil(20).max(1);
        let rotate_labels = n > 12;

        for (i, label) in series.labels.iter().enumerate() {
            let x = MARGIN_LEFT + i as f32 * slot + slot * 0.15;
            let movie_h = series.movies[i] as f32 / axis_max as f32 * plot_h;
            let tv_h = series.tv[i] as f32 / axis_max as f32 * plot_h;

            if movie_h > 0.0 {
                body.push_str(&format!(
                    r#"<rect x="{x:.1}" y="{:.1}" width="{bar_w:.1}" height="{movie_h:.1}" fill="{}"/>"#,
                    bottom - movie_h,
                    self.movie_color
                ));
                body.push('\n');
            }
            if tv_h > 0.0 {
                body.push_str(&format!(
                    r#"<rect x="{x:.1}" y="{:.1}" width="{bar_w:.1}" height="{tv_h:.1}" fill="{}"/>"#,
                    bottom - movie_h - tv_h,
                    self.tv_color
                ));
                body.push('\n');
            }

            if i % label_every == 0 {
                let cx = x + bar_w / 2.0;
                let ly = bottom + 16.0;
                if rotate_labels {
                    body.push_str(&format!(
                        r#"<text x="{cx:.1}" y="{ly:.1}" font-size="11" fill="{TEXT_COLOR}" text-anchor="end" transform="rotate(-45 {cx:.1} {ly:.1})">{}</text>"#,
                        escape_xml(label)
                    ));
                } else {
                    body.push_str(&format!(
                        r#"<text x="{cx:.1}" y="{ly:.1}" font-size="12" fill="{TEXT_COLOR}" text-anchor="middle">{}</text>"#,
                        escape_xml(label)
                    ));
                }
                body.push('\n');
            }
        }

        self.push_legend(&mut body);
        Ok(self.wrap_svg(chart, history, &body, MARGIN_LEFT))
    }

    /// Horizontal bars ordered by rank, one row per entry.
    fn ranked_chart(
        &self,
        chart: ChartKind,
        history: &PlayHistory,
        series: RankedSeries,
    ) -> Result<String, RenderError> {
        if series.is_empty() {
            return Err(RenderError::expected(format!(
                "no plays in the last {} days for {chart}",
                history.range_days
            )));
        }

        let plot_w = CANVAS_WIDTH - MARGIN_LEFT_RANKED - MARGIN_RIGHT;
        let plot_h = CANVAS_HEIGHT - MARGIN_TOP - MARGIN_BOTTOM;

        let peak = series.counts.iter().copied().max().unwrap_or(0);
        let axis_max = nice_axis_max(peak);

        let mut body = String::new();
        let n = series.labels.len();
        let row = plot_h / n as f32;
        let bar_h = row * 0.6;

        for (i, (label, count)) in series.labels.iter().zip(&series.counts).enumerate() {
            let y = MARGIN_TOP + i as f32 * row + row * 0.2;
            let w = *count as f32 / axis_max as f32 * plot_w;
            let text_y = y + bar_h / 2.0 + 4.0;

            body.push_str(&format!(
                r#"<rect x="{MARGIN_LEFT_RANKED:.1}" y="{y:.1}" width="{w:.1}" height="{bar_h:.1}" fill="{}"/>"#,
                self.tv_color
            ));
            body.push('\n');
            body.push_str(&format!(
                r#"<text x="{:.1}" y="{text_y:.1}" font-size="13" fill="{TEXT_COLOR}" text-anchor="end">{}</text>"#,
                MARGIN_LEFT_RANKED - 8.0,
                escape_xml(label)
            ));
            body.push('\n');
            body.push_str(&format!(
                r#"<text x="{:.1}" y="{text_y:.1}" font-size="12" fill="{TEXT_COLOR}">{count}</text>"#,
                MARGIN_LEFT_RANKED + w + 6.0
            ));
            body.push('\n');
        }

        Ok(self.wrap_svg(chart, history, &body, MARGIN_LEFT_RANKED))
    }

    fn push_grid(&self, body: &mut String, axis_max: u32, left: f32, plot_w: f32, plot_h: f32) {
        let bottom = MARGIN_TOP + plot_h;
        for tick in 0..=Y_TICKS {
            let value = axis_max / Y_TICKS * tick;
            let y = bottom - plot_h * tick as f32 / Y_TICKS as f32;
            body.push_str(&format!(
                r#"<line x1="{left:.1}" y1="{y:.1}" x2="{:.1}" y2="{y:.1}" stroke="{GRID_COLOR}" stroke-width="1"/>"#,
                left + plot_w
            ));
            body.push('\n');
            body.push_str(&format!(
                r#"<text x="{:.1}" y="{:.1}" font-size="12" fill="{TEXT_COLOR}" text-anchor="end">{value}</text>"#,
                left - 8.0,
                y + 4.0
            ));
            body.push('\n');
        }
    }

    fn push_legend(&self, body: &mut String) {
        let x = CANVAS_WIDTH - 200.0;
        let y = MARGIN_TOP - 28.0;
        body.push_str(&format!(
            r#"<rect x="{x:.1}" y="{y:.1}" width="12" height="12" fill="{}"/><text x="{:.1}" y="{:.1}" font-size="12" fill="{TEXT_COLOR}">Movies</text>"#,
            self.movie_color,
            x + 18.0,
            y + 10.0
        ));
        body.push('\n');
        body.push_str(&format!(
            r#"<rect x="{:.1}" y="{y:.1}" width="12" height="12" fill="{}"/><text x="{:.1}" y="{:.1}" font-size="12" fill="{TEXT_COLOR}">TV</text>"#,
            x + 90.0,
            self.tv_color,
            x + 108.0,
            y + 10.0
        ));
        body.push('\n');
    }

    fn wrap_svg(&self, chart: ChartKind, history: &PlayHistory, body: &str, left: f32) -> String {
        let bottom = CANVAS_HEIGHT - MARGIN_BOTTOM;
        let title = format!("{} (last {} days)", chart.title(), history.range_days);
        format!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{CANVAS_WIDTH}" height="{CANVAS_HEIGHT}" viewBox="0 0 {CANVAS_WIDTH} {CANVAS_HEIGHT}">
<rect width="{CANVAS_WIDTH}" height="{CANVAS_HEIGHT}" fill="{BACKGROUND}"/>
<text x="{:.1}" y="32" font-size="20" font-weight="bold" fill="{TEXT_COLOR}" text-anchor="middle">{}</text>
{body}<line x1="{left:.1}" y1="{MARGIN_TOP:.1}" x2="{left:.1}" y2="{bottom:.1}" stroke="{AXIS_COLOR}" stroke-width="1.5"/>
<line x1="{left:.1}" y1="{bottom:.1}" x2="{:.1}" y2="{bottom:.1}" stroke="{AXIS_COLOR}" stroke-width="1.5"/>
</svg>
"#,
            CANVAS_WIDTH / 2.0,
            escape_xml(&title),
            CANVAS_WIDTH - MARGIN_RIGHT,
        )
    }

    fn rasterize(&self, svg_content: &str, output_path: &Path) -> Result<(), RenderError> {
        use resvg::render;
        use tiny_skia::Pixmap;
        use usvg::{Options, Transform, Tree};

        let mut options = Options::default();
        options.font_family = "sans-serif".to_string();
        options.fontdb = self.fontdb.clone();

        let tree = Tree::from_str(svg_content, &options)
            .map_err(|e| RenderError::unexpected(format!("svg parse failed: {e}")))?;

        let size = tree.size().to_int_size();
        let mut pixmap = Pixmap::new(size.width(), size.height())
            .ok_or_else(|| RenderError::unexpected("pixmap allocation failed"))?;

        render(&tree, Transform::default(), &mut pixmap.as_mut());

        let png_data = pixmap
            .encode_png()
            .map_err(|e| RenderError::unexpected(format!("png encode failed: {e}")))?;

        std::fs::write(output_path, png_data).map_err(|e| {
            RenderError::unexpected(format!("could not write {}: {e}", output_path.display()))
        })?;

        Ok(())
    }
}

/// Round the axis maximum up so ticks land on whole counts.
fn nice_axis_max(peak: u32) -> u32 {
    let step = peak.div_ceil(Y_TICKS).max(1);
    step * Y_TICKS
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
