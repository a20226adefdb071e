// SVG choropleth rendering
//
// Template contract: one `<path data-region="N" fill="rgb(r, g, b)">` per
// region, plus `{{LEGEND_TITLE}}`, `{{DATE}}`, `{{MIN}}` and `{{MAX}}`
// placeholders anywhere in text or attribute values.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use quick_xml::escape::escape;
use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::name::QName;
use quick_xml::{Reader, Writer};
use thiserror::Error;

use casemap_recon::config::parse_hex_color;
use casemap_recon::metrics::{DateRange, MetricTable};
use casemap_recon::model::{columns, LongitudinalDataset, NormalizedRecord, RegionKey};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("template: {0}")]
    Template(String),
    #[error("region {region} has no {metric} value on {date}")]
    MissingMetric {
        region: RegionKey,
        date: NaiveDate,
        metric: String,
    },
    #[error("invalid bounds: max {max} must be greater than min {min}")]
    InvalidBounds { min: f64, max: f64 },
    #[error("{metric} has no values in the requested dates")]
    NoValues { metric: String },
    #[error("invalid color '{0}' (expected #rrggbb)")]
    InvalidColor(String),
    #[error("a gradient needs at least 2 colors, got {0}")]
    TooFewColors(usize),
    #[error("cannot write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Colors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rgb({}, {}, {})", self.0, self.1, self.2)
    }
}

/// Maps a normalized position to a color.
pub trait ColorScale {
    /// `t` is clamped to `[0, 1]`; NaN maps to 0.
    fn color_at(&self, t: f64) -> Rgb;
}

/// Piecewise-linear gradient through evenly spaced stops.
#[derive(Debug, Clone, PartialEq)]
pub struct Gradient {
    stops: Vec<Rgb>,
}

impl Gradient {
    pub fn new(stops: Vec<Rgb>) -> Result<Self, RenderError> {
        if stops.len() < 2 {
            return Err(RenderError::TooFewColors(stops.len()));
        }
        Ok(Self { stops })
    }

    pub fn from_hex<S: AsRef<str>>(colors: &[S]) -> Result<Self, RenderError> {
        let stops = colors
            .iter()
            .map(|c| {
                let c = c.as_ref();
                parse_hex_color(c)
                    .map(|(r, g, b)| Rgb(r, g, b))
                    .ok_or_else(|| RenderError::InvalidColor(c.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(stops)
    }
}

impl Default for Gradient {
    /// Blue through light gray to red.
    fn default() -> Self {
        Self {
            stops: vec![Rgb(0x3b, 0x4c, 0xc0), Rgb(0xdd, 0xdd, 0xdd), Rgb(0xb4, 0x04, 0x26)],
        }
    }
}

impl ColorScale for Gradient {
    fn color_at(&self, t: f64) -> Rgb {
        let t = if t.is_nan() { 0.0 } else { t.clamp(0.0, 1.0) };
        let segments = self.stops.len() - 1;
        let pos = t * segments as f64;
        let i = (pos.floor() as usize).min(segments - 1);
        let local = pos - i as f64;
        let (a, b) = (self.stops[i], self.stops[i + 1]);
        let mix = |x: u8, y: u8| (f64::from(x) + (f64::from(y) - f64::from(x)) * local).round().clamp(0.0, 255.0) as u8;
        Rgb(mix(a.0, b.0), mix(a.1, b.1), mix(a.2, b.2))
    }
}

// ---------------------------------------------------------------------------
// Bounds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub fn new(min: f64, max: f64) -> Result<Self, RenderError> {
        if !(max > min) || !min.is_finite() || !max.is_finite() {
            return Err(RenderError::InvalidBounds { min, max });
        }
        Ok(Self { min, max })
    }

    /// Explicit bounds where given, otherwise the observed min/max of
    /// `table` over `range`.
    pub fn resolve(
        table: &MetricTable,
        range: DateRange,
        min: Option<f64>,
        max: Option<f64>,
    ) -> Result<Self, RenderError> {
        let (min, max) = match (min, max) {
            (Some(lo), Some(hi)) => (lo, hi),
            _ => {
                let (lo, hi) = table.bounds(range).ok_or_else(|| RenderError::NoValues {
                    metric: table.name.clone(),
                })?;
                (min.unwrap_or(lo), max.unwrap_or(hi))
            }
        };
        Self::new(min, max)
    }

    /// Position of `value` in `[0, 1]`, clamped.
    pub fn position(&self, value: f64) -> f64 {
        ((value - self.min) / (self.max - self.min)).clamp(0.0, 1.0)
    }
}

// ---------------------------------------------------------------------------
// Tooltips
// ---------------------------------------------------------------------------

/// MODZCTAs that cover two ZIP codes.
const COMBINED_ZIPS: [(u32, &str); 6] = [
    (10001, "10001, 10118"),
    (10019, "10019, 10020"),
    (10075, "10075, 10162"),
    (11004, "11004, 11005"),
    (11211, "11211, 11249"),
    (11217, "11217, 11243"),
];

pub fn zip_label(region: RegionKey) -> String {
    COMBINED_ZIPS
        .iter()
        .find(|(code, _)| *code == region.0)
        .map(|(_, label)| (*label).to_string())
        .unwrap_or_else(|| region.to_string())
}

/// Human-readable value: integral values without decimals, others to 2 places.
pub fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        format!("{value:.2}")
    }
}

/// Unescaped tooltip text for a region's path.
pub fn tooltip(record: &NormalizedRecord, metric: &str, value: f64) -> String {
    let field = |column: &str| {
        let text = record.field_text(column);
        if text.is_empty() {
            "NA".to_string()
        } else {
            text
        }
    };
    [
        format!("Case Rate per 100k: {}", field(columns::CASE_RATE)),
        format!("ZIP Code: {}", zip_label(record.region)),
        format!("Neighborhood: {}", field(columns::NEIGHBORHOOD)),
        format!("Case Count: {}", field(columns::CASE_COUNT)),
        format!(
            "Percent of people tested who tested positive: {}",
            field(columns::PERCENT_POSITIVE)
        ),
        format!("Deaths: {}", field(columns::DEATH_COUNT)),
        format!("Death rate per 100,000: {}", field(columns::DEATH_RATE)),
        format!("{metric}: {}", format_value(value)),
    ]
    .join("; ")
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

pub struct MapStyle<'a> {
    pub legend_title: &'a str,
    pub bounds: Bounds,
    pub scale: &'a dyn ColorScale,
}

/// Escaped placeholder → escaped replacement.
struct Placeholders(Vec<(&'static str, String)>);

impl Placeholders {
    fn new(style: &MapStyle<'_>, date: NaiveDate) -> Self {
        Self(vec![
            ("{{LEGEND_TITLE}}", escape(style.legend_title).into_owned()),
            ("{{DATE}}", date.to_string()),
            ("{{MIN}}", format_value(style.bounds.min)),
            ("{{MAX}}", format_value(style.bounds.max)),
        ])
    }

    fn apply<'t>(&self, raw: &'t str) -> Cow<'t, str> {
        if !raw.contains("{{") {
            return Cow::Borrowed(raw);
        }
        let mut out = raw.to_string();
        for (key, value) in &self.0 {
            out = out.replace(key, value);
        }
        Cow::Owned(out)
    }
}

/// Per-date state threaded through element rewriting.
struct Paint<'a> {
    table: &'a MetricTable,
    date: NaiveDate,
    style: &'a MapStyle<'a>,
    rows: BTreeMap<RegionKey, &'a NormalizedRecord>,
    seen: BTreeSet<RegionKey>,
}

impl Paint<'_> {
    /// (fill, escaped aria-label) for a template region, `None` to keep the
    /// template's own attributes.
    fn region_attrs(&mut self, region: RegionKey) -> Result<Option<(String, String)>, RenderError> {
        self.seen.insert(region);
        let Some(record) = self.rows.get(&region) else {
            log::warn!("{}: template region {region} has no data row; keeping template fill", self.date);
            return Ok(None);
        };
        let value = self.table.get(region, self.date).ok_or_else(|| RenderError::MissingMetric {
            region,
            date: self.date,
            metric: self.table.name.clone(),
        })?;
        let fill = self.style.scale.color_at(self.style.bounds.position(value)).to_string();
        let label = escape(tooltip(record, &self.table.name, value).as_str()).into_owned();
        Ok(Some((fill, label)))
    }
}

fn template_err(err: impl fmt::Display) -> RenderError {
    RenderError::Template(err.to_string())
}

fn rewrite_element(
    e: &BytesStart<'_>,
    placeholders: &Placeholders,
    paint: &mut Paint<'_>,
) -> Result<BytesStart<'static>, RenderError> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();

    let mut attrs: Vec<(Vec<u8>, String)> = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(template_err)?;
        // Raw values stay escaped; a `"` legal inside single quotes is not
        // once re-emitted in double quotes.
        let raw = String::from_utf8_lossy(&attr.value).replace('"', "&quot;");
        attrs.push((attr.key.as_ref().to_vec(), placeholders.apply(&raw).into_owned()));
    }

    let region = attrs
        .iter()
        .find(|(key, _)| key.as_slice() == b"data-region")
        .map(|(_, value)| value.trim().to_string());

    if let Some(region) = region.filter(|_| name == "path") {
        let region = region
            .parse::<u32>()
            .map(RegionKey)
            .map_err(|_| RenderError::Template(format!("data-region '{region}' is not a region code")))?;

        if let Some((fill, label)) = paint.region_attrs(region)? {
            for (key, value) in [(b"fill".as_slice(), fill), (b"aria-label".as_slice(), label)] {
                match attrs.iter_mut().find(|(k, _)| k.as_slice() == key) {
                    Some(slot) => slot.1 = value,
                    None => attrs.push((key.to_vec(), value)),
                }
            }
        }
    }

    let mut out = BytesStart::new(name);
    for (key, value) in &attrs {
        out.push_attribute(Attribute {
            key: QName(key.as_slice()),
            value: Cow::Borrowed(value.as_bytes()),
        });
    }
    Ok(out)
}

/// Fill the template for one date.
pub fn render_svg(
    template: &str,
    dataset: &LongitudinalDataset,
    table: &MetricTable,
    date: NaiveDate,
    style: &MapStyle<'_>,
) -> Result<String, RenderError> {
    let placeholders = Placeholders::new(style, date);
    let mut paint = Paint {
        table,
        date,
        style,
        rows: dataset.on_date(date).map(|r| (r.region, r)).collect(),
        seen: BTreeSet::new(),
    };

    let mut reader = Reader::from_str(template);
    let mut writer = Writer::new(Vec::with_capacity(template.len()));

    loop {
        let event = reader.read_event().map_err(|e| {
            RenderError::Template(format!("at byte {}: {e}", reader.buffer_position()))
        })?;
        match event {
            Event::Eof => break,
            Event::Start(e) => {
                let e = rewrite_element(&e, &placeholders, &mut paint)?;
                writer.write_event(Event::Start(e)).map_err(template_err)?;
            }
            Event::Empty(e) => {
                let e = rewrite_element(&e, &placeholders, &mut paint)?;
                writer.write_event(Event::Empty(e)).map_err(template_err)?;
            }
            Event::Text(t) => {
                let raw = t.into_inner();
                let raw = String::from_utf8_lossy(&raw);
                let text = placeholders.apply(&raw).into_owned();
                writer
                    .write_event(Event::Text(BytesText::from_escaped(text)))
                    .map_err(template_err)?;
            }
            other => writer.write_event(other).map_err(template_err)?,
        }
    }

    let skipped: Vec<String> = paint
        .rows
        .keys()
        .filter(|r| !paint.seen.contains(r))
        .map(|r| r.to_string())
        .collect();
    if !skipped.is_empty() {
        log::warn!(
            "{date}: {} data region(s) not in template: {}",
            skipped.len(),
            skipped.join(", ")
        );
    }

    String::from_utf8(writer.into_inner()).map_err(template_err)
}

/// Render every date of `table` inside `range` into `out_dir` as
/// `<prefix>_<METRIC>_<YYYY-MM-DD>.svg`. Returns the written paths.
pub fn render_range(
    template: &str,
    dataset: &LongitudinalDataset,
    table: &MetricTable,
    range: DateRange,
    style: &MapStyle<'_>,
    out_dir: &Path,
    prefix: &str,
) -> Result<Vec<PathBuf>, RenderError> {
    std::fs::create_dir_all(out_dir).map_err(|source| RenderError::Io {
        path: out_dir.to_owned(),
        source,
    })?;

    let mut written = Vec::new();
    for date in table.dates().into_iter().filter(|d| range.contains(*d)) {
        let svg = render_svg(template, dataset, table, date, style)?;
        let path = out_dir.join(format!("{prefix}_{}_{date}.svg", table.name));
        std::fs::write(&path, svg).map_err(|source| RenderError::Io {
            path: path.clone(),
            source,
        })?;
        log::debug!("wrote {}", path.display());
        written.push(path);
    }

    if written.is_empty() {
        log::warn!("no {} dates in the requested range", table.name);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use casemap_recon::metrics::{Column, MetricTransform};

    const TEMPLATE: &str = r#"<svg xmlns="http://www.w3.org/2000/svg">
<title>{{LEGEND_TITLE}} {{DATE}}</title>
<path data-region="10001" d="M0 0" fill="rgb(0, 0, 0)" stroke-width="0.5"></path>
<path data-region="11697" d="M1 1" fill="rgb(0, 0, 0)"/>
<path data-region="10464" d="M2 2" fill="rgb(9, 9, 9)"></path>
<text>{{MIN}} to {{MAX}}</text>
</svg>"#;

    fn date(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, m, d).unwrap()
    }

    fn record(region: u32, day: u32, rate: Option<f64>) -> NormalizedRecord {
        let mut r = NormalizedRecord::new(RegionKey(region), date(5, day), 10);
        r.case_rate = rate;
        r.neighborhood = Some("Chelsea & Hudson Yards".into());
        r
    }

    fn dataset() -> LongitudinalDataset {
        LongitudinalDataset::from_records(vec![
            record(10001, 20, Some(0.0)),
            record(11697, 20, Some(100.0)),
            record(11368, 20, Some(50.0)),
            record(10001, 21, None),
            record(11697, 21, Some(80.0)),
        ])
    }

    fn style<'a>(scale: &'a Gradient, title: &'a str) -> MapStyle<'a> {
        MapStyle {
            legend_title: title,
            bounds: Bounds::new(0.0, 100.0).unwrap(),
            scale,
        }
    }

    #[test]
    fn gradient_endpoints_and_midpoint() {
        let g = Gradient::from_hex(&["#000000", "#ffffff"]).unwrap();
        assert_eq!(g.color_at(0.0), Rgb(0, 0, 0));
        assert_eq!(g.color_at(1.0), Rgb(255, 255, 255));
        assert_eq!(g.color_at(0.5), Rgb(128, 128, 128));
        assert_eq!(g.color_at(7.0), Rgb(255, 255, 255));
        assert_eq!(g.color_at(f64::NAN), Rgb(0, 0, 0));

        let three = Gradient::default();
        assert_eq!(three.color_at(0.5), Rgb(0xdd, 0xdd, 0xdd));
        assert!(Gradient::from_hex(&["#000000"]).is_err());
        assert!(matches!(Gradient::from_hex(&["#000000", "blue"]), Err(RenderError::InvalidColor(_))));
    }

    #[test]
    fn fills_labels_and_placeholders() {
        let ds = dataset();
        let table = MetricTable::from_dataset(&ds, &Column::CaseRate);
        let scale = Gradient::from_hex(&["#000000", "#ffffff"]).unwrap();
        let svg = render_svg(TEMPLATE, &ds, &table, date(5, 20), &style(&scale, "Rate <per 100k>")).unwrap();

        assert!(svg.contains("<title>Rate &lt;per 100k&gt; 2020-05-20</title>"), "{svg}");
        assert!(svg.contains("<text>0 to 100</text>"));
        assert!(svg.contains(r#"data-region="10001" d="M0 0" fill="rgb(0, 0, 0)""#));
        assert!(svg.contains(r#"data-region="11697" d="M1 1" fill="rgb(255, 255, 255)""#));
        // Template region without data keeps its fill.
        assert!(svg.contains(r#"fill="rgb(9, 9, 9)""#));
        // Combined ZIP label and escaped neighborhood.
        assert!(svg.contains("ZIP Code: 10001, 10118"));
        assert!(svg.contains("Neighborhood: Chelsea &amp; Hudson Yards"));
        assert!(svg.contains("COVID_CASE_RATE: 100"));
        assert!(!svg.contains("{{"));
    }

    #[test]
    fn missing_metric_is_error() {
        let ds = dataset();
        let table = MetricTable::from_dataset(&ds, &Column::CaseRate);
        let scale = Gradient::default();
        let err = render_svg(TEMPLATE, &ds, &table, date(5, 21), &style(&scale, "t")).unwrap_err();
        match err {
            RenderError::MissingMetric { region, date: d, metric } => {
                assert_eq!(region, RegionKey(10001));
                assert_eq!(d, date(5, 21));
                assert_eq!(metric, "COVID_CASE_RATE");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bounds_resolution() {
        let ds = dataset();
        let table = MetricTable::from_dataset(&ds, &Column::CaseRate);
        let all = DateRange::default();
        assert_eq!(Bounds::resolve(&table, all, None, None).unwrap(), Bounds { min: 0.0, max: 100.0 });
        assert_eq!(
            Bounds::resolve(&table, all, Some(-50.0), None).unwrap(),
            Bounds { min: -50.0, max: 100.0 }
        );
        assert!(matches!(
            Bounds::resolve(&table, all, Some(10.0), Some(10.0)),
            Err(RenderError::InvalidBounds { .. })
        ));
        let diffs = MetricTransform::Diff.apply(table);
        let only_first = DateRange {
            from: None,
            to: Some(date(5, 20)),
        };
        assert!(matches!(
            Bounds::resolve(&diffs, only_first, None, None),
            Err(RenderError::NoValues { .. })
        ));
    }

    #[test]
    fn position_clamps() {
        let b = Bounds::new(-50.0, 50.0).unwrap();
        assert_eq!(b.position(0.0), 0.5);
        assert_eq!(b.position(-80.0), 0.0);
        assert_eq!(b.position(75.0), 1.0);
    }

    #[test]
    fn malformed_region_code() {
        let ds = dataset();
        let table = MetricTable::from_dataset(&ds, &Column::CaseRate);
        let scale = Gradient::default();
        let template = r#"<svg><path data-region="abc" fill="rgb(0, 0, 0)"/></svg>"#;
        let err = render_svg(template, &ds, &table, date(5, 20), &style(&scale, "t")).unwrap_err();
        assert!(matches!(err, RenderError::Template(_)));
    }

    #[test]
    fn single_quoted_attribute_stays_well_formed() {
        let ds = dataset();
        let table = MetricTable::from_dataset(&ds, &Column::CaseRate);
        let scale = Gradient::default();
        let template = r#"<svg><path data-region="10001" class='say "hi"' fill="rgb(0, 0, 0)"/></svg>"#;
        let svg = render_svg(template, &ds, &table, date(5, 20), &style(&scale, "t")).unwrap();
        assert!(svg.contains(r#"class="say &quot;hi&quot;""#), "{svg}");

        let mut reader = Reader::from_str(&svg);
        loop {
            match reader.read_event().unwrap() {
                Event::Empty(e) if e.name().as_ref() == b"path" => {
                    let class = e
                        .attributes()
                        .map(|a| a.unwrap())
                        .find(|a| a.key.as_ref() == b"class")
                        .unwrap();
                    assert_eq!(class.unescape_value().unwrap(), r#"say "hi""#);
                    for attr in e.attributes() {
                        attr.unwrap();
                    }
                    break;
                }
                Event::Eof => panic!("no path element in {svg}"),
                _ => {}
            }
        }
    }

    #[test]
    fn range_writes_one_file_per_date() {
        let ds = dataset();
        let table = MetricTable::from_dataset(&ds, &Column::CaseRate);
        let scale = Gradient::default();
        let dir = tempfile::tempdir().unwrap();
        let range = DateRange {
            from: Some(date(5, 20)),
            to: Some(date(5, 20)),
        };
        let paths = render_range(TEMPLATE, &ds, &table, range, &style(&scale, "t"), dir.path(), "NYC").unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].file_name().unwrap(), "NYC_COVID_CASE_RATE_2020-05-20.svg");
        assert!(paths[0].exists());
    }
}
