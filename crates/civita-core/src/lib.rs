#![forbid(unsafe_code)]

//! The axis-labelling data model underneath every civita tensor.
//!
//! A tensor's shape is a [`Hypercube`]: an ordered list of named coordinate
//! vectors ([`XVector`]), each carrying a [`Dimension`] that types its
//! [`Value`] entries as strings, timestamps or numbers. Sparse tensors name
//! the cells they actually store with an [`Index`] of lineal hypercube
//! positions. Lineal addressing is column-major throughout: the first axis
//! varies fastest.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::format::{Item, StrftimeItems};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    BadValue { reason: String },
    InconvertibleUnits { from: String, to: String },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadValue { reason } => write!(f, "bad value: {reason}"),
            Self::InconvertibleUnits { from, to } => {
                write!(f, "inconvertible units '{from}' and '{to}'")
            }
        }
    }
}

impl std::error::Error for CoreError {}

fn bad_value(reason: impl Into<String>) -> CoreError {
    CoreError::BadValue {
        reason: reason.into(),
    }
}

/// The three coordinate kinds an axis can carry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DimensionType {
    #[default]
    Str,
    Time,
    Num,
}

impl DimensionType {
    const fn rank(self) -> u8 {
        match self {
            Self::Str => 0,
            Self::Time => 1,
            Self::Num => 2,
        }
    }
}

/// Descriptor of an axis: coordinate kind plus a units string. For [`Time`]
/// axes the units double as the strftime-style parse/format pattern, with
/// the `%Q` extension naming a calendar quarter.
///
/// [`Time`]: DimensionType::Time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dimension {
    pub kind: DimensionType,
    pub units: String,
}

impl Dimension {
    #[must_use]
    pub fn new(kind: DimensionType, units: impl Into<String>) -> Self {
        Self {
            kind,
            units: units.into(),
        }
    }
}

/// Dimension descriptors keyed by axis name.
pub type Dimensions = BTreeMap<String, Dimension>;

/// Pairwise unit conversion factors, keyed as `"from:to"`. A reverse entry
/// divides; identical units are the identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversions {
    table: BTreeMap<String, f64>,
}

impl Conversions {
    pub fn insert(&mut self, from: &str, to: &str, factor: f64) {
        self.table.insert(format!("{from}:{to}"), factor);
    }

    pub fn convert(&self, value: f64, from: &str, to: &str) -> Result<f64, CoreError> {
        if from == to {
            return Ok(value);
        }
        if let Some(factor) = self.table.get(&format!("{from}:{to}")) {
            return Ok(factor * value);
        }
        if let Some(factor) = self.table.get(&format!("{to}:{from}")) {
            return Ok(value / factor);
        }
        Err(CoreError::InconvertibleUnits {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// A single coordinate label: string, timestamp or number.
///
/// Ordering is total so values can key ordered sets: within a kind the
/// natural order applies (`Num` via `total_cmp`), across kinds the tag rank
/// `Str < Time < Num` decides.
#[derive(Debug, Clone)]
pub enum Value {
    Str(String),
    Time(NaiveDateTime),
    Num(f64),
}

impl Default for Value {
    fn default() -> Self {
        Self::Str(String::new())
    }
}

impl Value {
    #[must_use]
    pub fn kind(&self) -> DimensionType {
        match self {
            Self::Str(_) => DimensionType::Str,
            Self::Time(_) => DimensionType::Time,
            Self::Num(_) => DimensionType::Num,
        }
    }

    /// True for the default-constructed value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Str(s) if s.is_empty())
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_time(&self) -> Option<NaiveDateTime> {
        match self {
            Self::Time(t) => Some(*t),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_num(&self) -> Option<f64> {
        match self {
            Self::Num(x) => Some(*x),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::Num(x)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(t: NaiveDateTime) -> Self {
        Self::Time(t)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            (Self::Time(a), Self::Time(b)) => a.cmp(b),
            (Self::Num(a), Self::Num(b)) => a.total_cmp(b),
            _ => self.kind().rank().cmp(&other.kind().rank()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind().rank().hash(state);
        match self {
            Self::Str(s) => s.hash(state),
            Self::Time(t) => {
                t.date().num_days_from_ce().hash(state);
                t.time().num_seconds_from_midnight().hash(state);
                t.time().nanosecond().hash(state);
            }
            Self::Num(x) => x.to_bits().hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match format_value(self, "") {
            Ok(s) => f.write_str(&s),
            Err(_) => f.write_str("<unformattable>"),
        }
    }
}

/// Interpolate between `x` and `y` with fraction `a` in `[0, 1]`. Strings
/// snap to the nearer endpoint; mismatched kinds return `x`.
#[must_use]
pub fn interp(x: &Value, y: &Value, a: f64) -> Value {
    match (x, y) {
        (Value::Str(_), Value::Str(_)) => {
            if a <= 0.5 {
                x.clone()
            } else {
                y.clone()
            }
        }
        (Value::Num(xv), Value::Num(yv)) => Value::Num(yv * a + xv * (1.0 - a)),
        (Value::Time(xt), Value::Time(yt)) => {
            let span = *yt - *xt;
            let nanos = match span.num_nanoseconds() {
                Some(ns) => ns as f64,
                None => span.num_microseconds().map_or_else(
                    || span.num_milliseconds() as f64 * 1e6,
                    |us| us as f64 * 1e3,
                ),
            };
            Value::Time(*xt + Duration::nanoseconds((nanos * a) as i64))
        }
        _ => x.clone(),
    }
}

/// Signed real-valued distance between two coordinates of the same kind.
/// Numbers subtract; strings use a Hamming distance signed by lexicographic
/// order; timestamps resolve to nanoseconds, falling back to microseconds
/// when the span overflows the nanosecond range.
pub fn diff(x: &Value, y: &Value) -> Result<f64, CoreError> {
    match (x, y) {
        (Value::Str(a), Value::Str(b)) => {
            let mut r = (a.len() as f64 - b.len() as f64).abs();
            for (ca, cb) in a.bytes().zip(b.bytes()) {
                if ca != cb {
                    r += 1.0;
                }
            }
            Ok(if a < b { -r } else { r })
        }
        (Value::Num(a), Value::Num(b)) => Ok(a - b),
        (Value::Time(a), Value::Time(b)) => {
            let span = *a - *b;
            if let Some(ns) = span.num_nanoseconds() {
                Ok(1e-9 * ns as f64)
            } else if let Some(us) = span.num_microseconds() {
                Ok(1e-6 * us as f64)
            } else {
                Ok(1e-3 * span.num_milliseconds() as f64)
            }
        }
        _ => Err(bad_value(format!(
            "incompatible value kinds {:?} and {:?} in diff",
            x.kind(),
            y.kind()
        ))),
    }
}

// ---------------------------------------------------------------------------
// Coordinate label grammar
// ---------------------------------------------------------------------------

/// How a time dimension's units string is interpreted when parsing labels.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TimeGrammar {
    /// Units contain `%Q`: year and quarter are extracted positionally.
    Quarter,
    /// Only `{%Y,%m,%d,%H,%M,%S,%y}` fields with separators: digit runs are
    /// consumed positionally, missing fields default to Jan 1 midnight.
    Fielded(Vec<u8>),
    /// Anything more exotic is handed to chrono with the exact pattern.
    Delegate,
}

fn classify_time_format(units: &str) -> TimeGrammar {
    if units.contains("%Q") {
        return TimeGrammar::Quarter;
    }
    let bytes = units.as_bytes();
    let mut fields = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let Some(&c) = bytes.get(i + 1) else {
                return TimeGrammar::Delegate;
            };
            if !matches!(c, b'm' | b'd' | b'y' | b'Y' | b'H' | b'M' | b'S') {
                return TimeGrammar::Delegate;
            }
            // abutting fields ("%Y%m") leave no separator for the positional
            // scan to anchor on
            if bytes.get(i + 2) == Some(&b'%') {
                return TimeGrammar::Delegate;
            }
            fields.push(c);
            i += 2;
        } else {
            i += 1;
        }
    }
    if units.is_empty() {
        fields = vec![b'Y', b'm', b'd', b'H', b'M', b'S'];
    }
    TimeGrammar::Fielded(fields)
}

/// Two-digit years pivot at 1969: 00-68 land in 2000-2068, 69-99 in
/// 1969-1999.
fn pivot_two_digit_year(v: i64) -> Result<i64, CoreError> {
    if v > 99 {
        return Err(bad_value(format!("{v} is out of range for %y")));
    }
    Ok(if v > 68 { v + 1900 } else { v + 2000 })
}

fn parse_fielded(units: &str, fields: &[u8], text: &str) -> Result<Value, CoreError> {
    let bytes = text.as_bytes();
    let mut pos = 0usize;
    let mut consumed = 0usize;
    let (mut year, mut month, mut day) = (0i64, 1i64, 1i64);
    let (mut hours, mut minutes, mut seconds) = (0i64, 0i64, 0i64);
    for &field in fields {
        while pos < bytes.len() && !bytes[pos].is_ascii_digit() {
            pos += 1;
        }
        if pos >= bytes.len() {
            break;
        }
        let start = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            pos += 1;
        }
        let run = &text[start..pos];
        let v: i64 = run
            .parse()
            .map_err(|_| bad_value(format!("digit run '{run}' out of range in '{text}'")))?;
        match field {
            b'd' => day = v,
            b'm' => month = v,
            b'y' => year = pivot_two_digit_year(v)?,
            b'Y' => year = v,
            b'H' => hours = v,
            b'M' => minutes = v,
            b'S' => seconds = v,
            _ => {}
        }
        consumed += 1;
    }
    if !units.is_empty() && consumed < fields.len() {
        return Err(bad_value(format!(
            "invalid date/time: '{text}' for format '{units}'"
        )));
    }
    let date = NaiveDate::from_ymd_opt(
        i32::try_from(year).map_err(|_| bad_value(format!("year {year} out of range")))?,
        u32::try_from(month).unwrap_or(0),
        u32::try_from(day).unwrap_or(0),
    )
    .ok_or_else(|| bad_value(format!("invalid date/time: '{text}' for format '{units}'")))?;
    let time = NaiveTime::from_hms_opt(
        u32::try_from(hours).unwrap_or(u32::MAX),
        u32::try_from(minutes).unwrap_or(u32::MAX),
        u32::try_from(seconds).unwrap_or(u32::MAX),
    )
    .ok_or_else(|| bad_value(format!("invalid date/time: '{text}' for format '{units}'")))?;
    Ok(Value::Time(date.and_time(time)))
}

/// Match `text` against `fmt` where two `%X` escapes at byte positions
/// `a.0`/`b.0` capture digit runs of width `a.1`/`b.1`; everything else
/// matches literally. Returns the two captures in format order.
fn extract_two(
    fmt: &str,
    text: &str,
    a: (usize, usize),
    b: (usize, usize),
) -> Result<(i64, i64), CoreError> {
    let fail = || bad_value(format!("'{text}' fails to match pattern '{fmt}'"));
    let s = text.trim();
    let mut pos = 0usize;

    let match_literal = |segment: &str, pos: &mut usize| -> Result<(), CoreError> {
        let end = *pos + segment.len();
        if s.get(*pos..end) != Some(segment) {
            return Err(fail());
        }
        *pos = end;
        Ok(())
    };
    let capture = |width: usize, pos: &mut usize| -> Result<i64, CoreError> {
        let end = *pos + width;
        let run = s.get(*pos..end).ok_or_else(|| fail())?;
        if !run.bytes().all(|c| c.is_ascii_digit()) {
            return Err(fail());
        }
        *pos = end;
        run.parse().map_err(|_| fail())
    };

    match_literal(&fmt[..a.0], &mut pos)?;
    let first = capture(a.1, &mut pos)?;
    match_literal(&fmt[a.0 + 2..b.0], &mut pos)?;
    let second = capture(b.1, &mut pos)?;
    match_literal(&fmt[b.0 + 2..], &mut pos)?;
    if pos != s.len() {
        return Err(fail());
    }
    Ok((first, second))
}

fn parse_quarter(units: &str, text: &str) -> Result<Value, CoreError> {
    let pq = units
        .find("%Q")
        .ok_or_else(|| bad_value("quarter field %Q missing from format string"))?;
    let (py, year_width, two_digit) = if let Some(p) = units.find("%Y") {
        (p, 4usize, false)
    } else if let Some(p) = units.find("%y") {
        (p, 2usize, true)
    } else {
        return Err(bad_value("year not specified in format string"));
    };

    let (mut year, quarter) = if pq < py {
        let (q, y) = extract_two(units, text, (pq, 1), (py, year_width))?;
        (y, q)
    } else {
        let (y, q) = extract_two(units, text, (py, year_width), (pq, 1))?;
        (y, q)
    };
    if two_digit {
        year = pivot_two_digit_year(year)?;
    }
    if !(1..=4).contains(&quarter) {
        return Err(bad_value(format!("invalid quarter {quarter}")));
    }
    let month = [1u32, 4, 7, 10][(quarter - 1) as usize];
    let date = NaiveDate::from_ymd_opt(
        i32::try_from(year).map_err(|_| bad_value(format!("year {year} out of range")))?,
        month,
        1,
    )
    .ok_or_else(|| bad_value(format!("year {year} out of range")))?;
    Ok(Value::Time(date.and_time(NaiveTime::MIN)))
}

fn parse_delegate(units: &str, text: &str) -> Result<Value, CoreError> {
    NaiveDateTime::parse_from_str(text, units)
        .or_else(|_| NaiveDate::parse_from_str(text, units).map(|d| d.and_time(NaiveTime::MIN)))
        .map(Value::Time)
        .map_err(|_| bad_value(format!("invalid date/time: '{text}' for format '{units}'")))
}

/// Parses textual labels into [`Value`]s under a dimension's type and units.
#[derive(Debug, Clone)]
pub struct ValueParser {
    dimension: Dimension,
    grammar: TimeGrammar,
}

impl ValueParser {
    #[must_use]
    pub fn new(dimension: &Dimension) -> Self {
        Self {
            dimension: dimension.clone(),
            grammar: classify_time_format(&dimension.units),
        }
    }

    pub fn parse(&self, text: &str) -> Result<Value, CoreError> {
        match self.dimension.kind {
            DimensionType::Str => {
                // empty strings mean "default value"; a label that is
                // genuinely blank becomes a single space instead
                if text.is_empty() {
                    Ok(Value::Str(" ".to_string()))
                } else {
                    Ok(Value::Str(text.to_string()))
                }
            }
            DimensionType::Num => {
                if text.is_empty() {
                    return Ok(Value::Num(f64::NAN));
                }
                text.trim()
                    .parse::<f64>()
                    .map(Value::Num)
                    .map_err(|_| bad_value(format!("cannot parse '{text}' as a number")))
            }
            DimensionType::Time => {
                if text.is_empty() {
                    return Err(bad_value("empty time label"));
                }
                match &self.grammar {
                    TimeGrammar::Quarter => parse_quarter(&self.dimension.units, text),
                    TimeGrammar::Fielded(fields) => {
                        parse_fielded(&self.dimension.units, fields, text)
                    }
                    TimeGrammar::Delegate => parse_delegate(&self.dimension.units, text),
                }
            }
        }
    }
}

/// Render a coordinate as text. Strings pass through, numbers use standard
/// decimal conversion, timestamps honour `format` (`%Q` splices the
/// calendar quarter) or ISO-8601 extended when `format` is empty.
pub fn format_value(value: &Value, format: &str) -> Result<String, CoreError> {
    match value {
        Value::Str(s) => Ok(s.clone()),
        Value::Num(x) => Ok(x.to_string()),
        Value::Time(t) => {
            if format.is_empty() {
                return Ok(t.format("%Y-%m-%dT%H:%M:%S%.f").to_string());
            }
            if format.contains("%Q") {
                if !format.contains("%Y") && !format.contains("%y") {
                    return Err(bad_value("year not specified in format string"));
                }
                let quarter = t.month0() / 3 + 1;
                let mut out = String::new();
                let mut chars = format.chars();
                while let Some(c) = chars.next() {
                    if c != '%' {
                        out.push(c);
                        continue;
                    }
                    match chars.next() {
                        Some('Q') => out.push_str(&quarter.to_string()),
                        Some('Y') => out.push_str(&t.year().to_string()),
                        Some('y') => out.push_str(&format!("{:02}", t.year().rem_euclid(100))),
                        Some(other) => {
                            out.push('%');
                            out.push(other);
                        }
                        None => out.push('%'),
                    }
                }
                Ok(out)
            } else {
                let items: Vec<Item<'_>> = StrftimeItems::new(format).collect();
                if items.iter().any(|item| matches!(item, Item::Error)) {
                    return Err(bad_value(format!("invalid time format '{format}'")));
                }
                use std::fmt::Write as _;
                let mut out = String::new();
                write!(out, "{}", t.format_with_items(items.into_iter()))
                    .map_err(|_| bad_value(format!("time format '{format}' not renderable")))?;
                Ok(out)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// XVector
// ---------------------------------------------------------------------------

/// One axis of a hypercube: a named, ordered run of coordinate values
/// sharing a single dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XVector {
    pub name: String,
    pub dimension: Dimension,
    entries: Vec<Value>,
}

impl XVector {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dimension: Dimension::default(),
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_dimension(name: impl Into<String>, dimension: Dimension) -> Self {
        Self {
            name: name.into(),
            dimension,
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn from_values(
        name: impl Into<String>,
        dimension: Dimension,
        entries: Vec<Value>,
    ) -> Self {
        Self {
            name: name.into(),
            dimension,
            entries,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &[Value] {
        &self.entries
    }

    #[must_use]
    pub fn get(&self, i: usize) -> Option<&Value> {
        self.entries.get(i)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.entries.iter()
    }

    pub fn push(&mut self, value: Value) {
        self.entries.push(value);
    }

    /// Parse a textual label through this axis's dimension and append it.
    pub fn push_label(&mut self, text: &str) -> Result<(), CoreError> {
        let value = ValueParser::new(&self.dimension).parse(text)?;
        self.entries.push(value);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// True when every entry's kind matches the dimension's.
    #[must_use]
    pub fn is_uniform(&self) -> bool {
        self.entries.iter().all(|v| v.kind() == self.dimension.kind)
    }

    /// Re-parse any entry whose kind disagrees with the dimension, going
    /// through the textual form.
    pub fn impose_dimension(&mut self) -> Result<(), CoreError> {
        if self.is_uniform() {
            return Ok(());
        }
        let parser = ValueParser::new(&self.dimension);
        for entry in &mut self.entries {
            let text = format_value(entry, "")?;
            *entry = parser.parse(&text)?;
        }
        debug_assert!(self.is_uniform());
        Ok(())
    }

    /// Display-format hint chosen from the temporal span of the entries.
    /// Empty for non-time axes.
    #[must_use]
    pub fn time_format(&self) -> &'static str {
        if self.dimension.kind != DimensionType::Time || self.entries.is_empty() {
            return "";
        }
        let (Some(front), Some(back)) = (
            self.entries.first().and_then(Value::as_time),
            self.entries.last().and_then(Value::as_time),
        ) else {
            return "";
        };
        let span = if front > back {
            front - back
        } else {
            back - front
        };
        let day = Duration::hours(24);
        let month = day * 30;
        let year = day * 365;
        if span > year * 5 {
            "%Y"
        } else if span > year {
            "%b %Y"
        } else if span > month * 6 {
            "%b"
        } else if span > month {
            "%d %b"
        } else if span > day {
            "%d %H:%M"
        } else if span > Duration::hours(1) {
            "%H:%M"
        } else if span > Duration::minutes(1) {
            "%M:%S"
        } else {
            "%s"
        }
    }
}

impl std::ops::Index<usize> for XVector {
    type Output = Value;

    fn index(&self, i: usize) -> &Value {
        &self.entries[i]
    }
}

impl<'a> IntoIterator for &'a XVector {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

// ---------------------------------------------------------------------------
// Hypercube
// ---------------------------------------------------------------------------

/// The labelled shape of a tensor: an ordered list of axes. Lineal
/// positions unfold column-major, first axis fastest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hypercube {
    pub xvectors: Vec<XVector>,
}

impl Hypercube {
    #[must_use]
    pub fn new(xvectors: Vec<XVector>) -> Self {
        Self { xvectors }
    }

    /// Synthetic numeric axes named "0","1",… with coordinates `0..d`.
    #[must_use]
    pub fn from_dims(dims: &[usize]) -> Self {
        let mut xvectors = Vec::with_capacity(dims.len());
        for (i, &d) in dims.iter().enumerate() {
            let mut xv =
                XVector::with_dimension(i.to_string(), Dimension::new(DimensionType::Num, ""));
            for j in 0..d {
                xv.push(Value::Num(j as f64));
            }
            xvectors.push(xv);
        }
        Self { xvectors }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.xvectors.len()
    }

    #[must_use]
    pub fn dims(&self) -> Vec<usize> {
        self.xvectors.iter().map(XVector::len).collect()
    }

    #[must_use]
    pub fn dim_labels(&self) -> Vec<String> {
        self.xvectors.iter().map(|xv| xv.name.clone()).collect()
    }

    #[must_use]
    pub fn num_elements(&self) -> usize {
        self.xvectors.iter().map(XVector::len).product()
    }

    /// Logarithmic sibling of [`num_elements`](Self::num_elements) for
    /// overflow checks on very large shapes.
    #[must_use]
    pub fn log_num_elements(&self) -> f64 {
        self.xvectors.iter().map(|xv| (xv.len() as f64).ln()).sum()
    }

    #[must_use]
    pub fn dims_are_distinct(&self) -> bool {
        let mut names = BTreeSet::new();
        self.xvectors.iter().all(|xv| names.insert(&xv.name))
    }

    /// Per-axis coordinates of lineal position `i`.
    #[must_use]
    pub fn split_index(&self, i: usize) -> Vec<usize> {
        let mut split = Vec::with_capacity(self.xvectors.len());
        let mut rest = i;
        for xv in &self.xvectors {
            let size = xv.len().max(1);
            split.push(rest % size);
            rest /= size;
        }
        split
    }

    /// Lineal position of a per-axis coordinate vector. Callers keep each
    /// coordinate below the axis size.
    #[must_use]
    pub fn lineal_index(&self, split: &[usize]) -> usize {
        debug_assert_eq!(split.len(), self.rank());
        let mut lineal = 0usize;
        let mut stride = 1usize;
        for (coord, xv) in split.iter().zip(&self.xvectors) {
            debug_assert!(*coord < xv.len().max(1));
            lineal += coord * stride;
            stride *= xv.len();
        }
        lineal
    }
}

/// Merge `other` into `result` by axis name. Shared string-typed axes take
/// the set intersection of their entries; shared non-string axes take the
/// interval intersection when `intersection` is set and the set union
/// otherwise. Axes only in `other` are appended in their `other` order, and
/// every merged axis ends up sorted in `Value` order. An `other` with zero
/// elements empties `result` in intersection mode.
pub fn union_hc(result: &mut Hypercube, other: &Hypercube, intersection: bool) {
    if intersection && other.num_elements() == 0 {
        result.xvectors.clear();
        return;
    }

    let mut indexed: BTreeMap<String, BTreeSet<Value>> = BTreeMap::new();
    for xv in &result.xvectors {
        indexed
            .entry(xv.name.clone())
            .or_default()
            .extend(xv.entries().iter().cloned());
    }

    let mut extra_dims: Vec<XVector> = Vec::new();
    for xv in &other.xvectors {
        let Some(merged) = indexed.get_mut(&xv.name) else {
            extra_dims.push(xv.clone());
            continue;
        };
        if xv.dimension.kind == DimensionType::Str {
            let other_set: BTreeSet<&Value> = xv.entries().iter().collect();
            merged.retain(|v| other_set.contains(v));
        } else if intersection {
            if merged.is_empty() {
                result.xvectors.clear();
                return;
            }
            // clamp to the overlap of the two coordinate ranges
            let (Some(other_min), Some(other_max)) =
                (xv.entries().iter().min(), xv.entries().iter().max())
            else {
                continue;
            };
            let lo = merged
                .iter()
                .next()
                .map(|v| if v > other_min { v.clone() } else { other_min.clone() })
                .unwrap_or_else(|| other_min.clone());
            let hi = merged
                .iter()
                .next_back()
                .map(|v| if v < other_max { v.clone() } else { other_max.clone() })
                .unwrap_or_else(|| other_max.clone());
            merged.retain(|v| *v >= lo && *v <= hi);
            for v in xv.entries() {
                if *v >= lo && *v <= hi {
                    merged.insert(v.clone());
                }
            }
        } else {
            merged.extend(xv.entries().iter().cloned());
        }
    }

    for xv in &mut result.xvectors {
        if let Some(merged) = indexed.get(&xv.name) {
            xv.clear();
            for v in merged {
                xv.push(v.clone());
            }
        }
    }
    result.xvectors.extend(extra_dims);
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

/// The sparse-storage index: a sorted, duplicate-free run of lineal
/// hypercube positions naming the cells a tensor actually stores. An empty
/// index marks dense storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Index {
    positions: Vec<usize>,
}

impl Index {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt an already-sorted, duplicate-free position vector.
    #[must_use]
    pub fn from_sorted(positions: Vec<usize>) -> Self {
        let index = Self { positions };
        debug_assert!(index.is_sorted_unique());
        index
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn clear(&mut self) {
        self.positions.clear();
    }

    /// Hypercube position of physical offset `i`; an empty index is the
    /// identity (dense).
    #[must_use]
    pub fn get(&self, i: usize) -> usize {
        if self.positions.is_empty() {
            i
        } else {
            self.positions[i]
        }
    }

    /// Physical offset of hypercube position `h`, or `len()` when absent.
    #[must_use]
    pub fn lineal_offset(&self, h: usize) -> usize {
        match self.positions.binary_search(&h) {
            Ok(offset) => offset,
            Err(_) => self.positions.len(),
        }
    }

    #[must_use]
    pub fn positions(&self) -> &[usize] {
        &self.positions
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.positions.iter().copied()
    }

    #[must_use]
    pub fn is_sorted_unique(&self) -> bool {
        self.positions.windows(2).all(|w| w[0] < w[1])
    }
}

impl From<BTreeSet<usize>> for Index {
    fn from(set: BTreeSet<usize>) -> Self {
        Self {
            positions: set.into_iter().collect(),
        }
    }
}

impl<V> From<&BTreeMap<usize, V>> for Index {
    fn from(map: &BTreeMap<usize, V>) -> Self {
        Self {
            positions: map.keys().copied().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use chrono::{NaiveDate, NaiveTime};
    use proptest::prelude::*;

    use super::{
        Conversions, CoreError, Dimension, DimensionType, Hypercube, Index, Value, ValueParser,
        XVector, diff, format_value, interp, union_hc,
    };

    fn time(y: i32, m: u32, d: u32) -> Value {
        Value::Time(
            NaiveDate::from_ymd_opt(y, m, d)
                .expect("valid test date")
                .and_time(NaiveTime::MIN),
        )
    }

    fn num_axis(name: &str, coords: &[f64]) -> XVector {
        XVector::from_values(
            name,
            Dimension::new(DimensionType::Num, ""),
            coords.iter().copied().map(Value::Num).collect(),
        )
    }

    fn str_axis(name: &str, labels: &[&str]) -> XVector {
        XVector::from_values(
            name,
            Dimension::new(DimensionType::Str, ""),
            labels.iter().map(|l| Value::from(*l)).collect(),
        )
    }

    #[test]
    fn value_orders_within_and_across_kinds() {
        assert!(Value::from("a") < Value::from("b"));
        assert!(Value::Num(1.0) < Value::Num(2.0));
        assert!(time(2019, 1, 1) < time(2020, 1, 1));
        // tag rank: Str < Time < Num
        assert!(Value::from("zzz") < time(1970, 1, 1));
        assert!(time(2100, 1, 1) < Value::Num(-1e300));
    }

    #[test]
    fn default_value_is_empty_string() {
        let v = Value::default();
        assert!(v.is_empty());
        assert_eq!(v.kind(), DimensionType::Str);
    }

    #[test]
    fn interp_per_kind() {
        assert_eq!(
            interp(&Value::Num(1.0), &Value::Num(3.0), 0.5),
            Value::Num(2.0)
        );
        assert_eq!(
            interp(&Value::from("x"), &Value::from("y"), 0.4),
            Value::from("x")
        );
        assert_eq!(
            interp(&Value::from("x"), &Value::from("y"), 0.6),
            Value::from("y")
        );
        assert_eq!(
            interp(&time(2019, 1, 1), &time(2019, 1, 3), 0.5),
            time(2019, 1, 2)
        );
        // mismatched kinds return the left operand
        assert_eq!(
            interp(&Value::Num(1.0), &Value::from("y"), 0.9),
            Value::Num(1.0)
        );
    }

    #[test]
    fn diff_is_signed() {
        assert_eq!(diff(&Value::Num(5.0), &Value::Num(2.0)).unwrap(), 3.0);
        // one substitution, equal lengths, x < y lexicographically
        assert_eq!(diff(&Value::from("abc"), &Value::from("abd")).unwrap(), -1.0);
        assert_eq!(diff(&Value::from("abd"), &Value::from("abc")).unwrap(), 1.0);
        let day = diff(&time(2019, 1, 2), &time(2019, 1, 1)).unwrap();
        assert_eq!(day, 86_400.0);
        assert!(diff(&Value::Num(1.0), &Value::from("a")).is_err());
    }

    #[test]
    fn conversions_forward_reverse_and_missing() {
        let mut conv = Conversions::default();
        conv.insert("km", "m", 1000.0);
        assert_eq!(conv.convert(2.0, "km", "m").unwrap(), 2000.0);
        assert_eq!(conv.convert(500.0, "m", "km").unwrap(), 0.5);
        assert_eq!(conv.convert(7.0, "kg", "kg").unwrap(), 7.0);
        assert!(matches!(
            conv.convert(1.0, "kg", "m"),
            Err(CoreError::InconvertibleUnits { .. })
        ));
    }

    #[test]
    fn quarter_labels_parse_and_format() {
        let dim = Dimension::new(DimensionType::Time, "%Y Q%Q");
        let parser = ValueParser::new(&dim);
        assert_eq!(parser.parse("2019 Q3").unwrap(), time(2019, 7, 1));
        assert_eq!(parser.parse("2019 Q1").unwrap(), time(2019, 1, 1));
        assert!(matches!(
            parser.parse("2019 Q5"),
            Err(CoreError::BadValue { .. })
        ));

        // quarter first
        let parser = ValueParser::new(&Dimension::new(DimensionType::Time, "Q%Q %Y"));
        assert_eq!(parser.parse("Q4 2021").unwrap(), time(2021, 10, 1));

        // two-digit year with pivot
        let parser = ValueParser::new(&Dimension::new(DimensionType::Time, "%y Q%Q"));
        assert_eq!(parser.parse("68 Q1").unwrap(), time(2068, 1, 1));
        assert_eq!(parser.parse("69 Q1").unwrap(), time(1969, 1, 1));

        // formatting splices quarter and year back
        assert_eq!(
            format_value(&time(2019, 7, 1), "%Y Q%Q").unwrap(),
            "2019 Q3"
        );
        assert!(format_value(&time(2019, 7, 1), "Q%Q only").is_err());
    }

    #[test]
    fn quarter_format_requires_year() {
        let parser = ValueParser::new(&Dimension::new(DimensionType::Time, "Q%Q"));
        assert!(matches!(
            parser.parse("Q2"),
            Err(CoreError::BadValue { .. })
        ));
    }

    #[test]
    fn fielded_labels_parse_with_defaults() {
        let parser = ValueParser::new(&Dimension::new(DimensionType::Time, "%Y-%m-%d"));
        assert_eq!(parser.parse("2019-02-03").unwrap(), time(2019, 2, 3));
        // single-digit fields are fine, separators are free-form
        assert_eq!(parser.parse("2019-2-3").unwrap(), time(2019, 2, 3));

        let parser = ValueParser::new(&Dimension::new(DimensionType::Time, "%Y"));
        assert_eq!(parser.parse("2019").unwrap(), time(2019, 1, 1));

        // empty units: %Y %m %d %H %M %S positionally
        let parser = ValueParser::new(&Dimension::new(DimensionType::Time, ""));
        let v = parser.parse("2019 03 04 05 06 07").unwrap();
        let expected = NaiveDate::from_ymd_opt(2019, 3, 4)
            .unwrap()
            .and_hms_opt(5, 6, 7)
            .unwrap();
        assert_eq!(v, Value::Time(expected));

        // too few digit runs for a non-empty format
        let parser = ValueParser::new(&Dimension::new(DimensionType::Time, "%Y %m"));
        assert!(parser.parse("2019 11").is_ok());
        assert!(parser.parse("only2019").is_err());
        assert!(parser.parse("nothing").is_err());
    }

    #[test]
    fn two_digit_year_pivots() {
        let parser = ValueParser::new(&Dimension::new(DimensionType::Time, "%y"));
        assert_eq!(parser.parse("68").unwrap(), time(2068, 1, 1));
        assert_eq!(parser.parse("69").unwrap(), time(1969, 1, 1));
        assert_eq!(parser.parse("00").unwrap(), time(2000, 1, 1));
        assert!(parser.parse("100").is_err());
    }

    #[test]
    fn abutting_fields_delegate_to_chrono() {
        let parser = ValueParser::new(&Dimension::new(DimensionType::Time, "%Y%m%d"));
        assert_eq!(parser.parse("20190203").unwrap(), time(2019, 2, 3));
        assert!(parser.parse("garbage").is_err());
    }

    #[test]
    fn numeric_and_string_labels() {
        let mut xv = XVector::with_dimension("x", Dimension::new(DimensionType::Num, ""));
        xv.push_label("2.5").unwrap();
        assert_eq!(xv[0], Value::Num(2.5));
        xv.push_label("").unwrap();
        assert!(xv[1].as_num().unwrap().is_nan());
        assert!(xv.push_label("not a number").is_err());

        let mut sv = XVector::new("s");
        sv.push_label("").unwrap();
        assert_eq!(sv[0], Value::from(" "));
    }

    #[test]
    fn format_value_per_kind() {
        assert_eq!(format_value(&Value::from("abc"), "").unwrap(), "abc");
        assert_eq!(format_value(&Value::Num(1.5), "").unwrap(), "1.5");
        assert_eq!(
            format_value(&time(2019, 2, 3), "").unwrap(),
            "2019-02-03T00:00:00"
        );
        assert_eq!(
            format_value(&time(2019, 2, 3), "%d/%m/%Y").unwrap(),
            "03/02/2019"
        );
    }

    #[test]
    fn impose_dimension_reparses_entries() {
        let mut xv = XVector::from_values(
            "x",
            Dimension::new(DimensionType::Num, ""),
            vec![Value::from("1"), Value::from("2.5")],
        );
        assert!(!xv.is_uniform());
        xv.impose_dimension().unwrap();
        assert_eq!(xv.entries(), &[Value::Num(1.0), Value::Num(2.5)]);
    }

    #[test]
    fn display_hint_follows_span() {
        let mk = |a: Value, b: Value| {
            XVector::from_values("t", Dimension::new(DimensionType::Time, ""), vec![a, b])
        };
        assert_eq!(mk(time(2000, 1, 1), time(2010, 1, 1)).time_format(), "%Y");
        assert_eq!(mk(time(2000, 1, 1), time(2002, 1, 1)).time_format(), "%b %Y");
        assert_eq!(mk(time(2000, 1, 1), time(2000, 8, 1)).time_format(), "%b");
        assert_eq!(mk(time(2000, 1, 1), time(2000, 2, 15)).time_format(), "%d %b");
        assert_eq!(
            mk(time(2000, 1, 1), time(2000, 1, 3)).time_format(),
            "%d %H:%M"
        );
        // reversed order spans the same interval
        assert_eq!(mk(time(2010, 1, 1), time(2000, 1, 1)).time_format(), "%Y");
        assert_eq!(num_axis("x", &[1.0]).time_format(), "");
    }

    #[test]
    fn hypercube_from_dims_builds_synthetic_axes() {
        let hc = Hypercube::from_dims(&[5, 3, 2]);
        assert_eq!(hc.rank(), 3);
        assert_eq!(hc.dims(), vec![5, 3, 2]);
        assert_eq!(hc.num_elements(), 30);
        assert_eq!(hc.dim_labels(), vec!["0", "1", "2"]);
        assert_eq!(hc.xvectors[1][2], Value::Num(2.0));
        assert!(hc.dims_are_distinct());
    }

    #[test]
    fn lineal_is_column_major() {
        let hc = Hypercube::from_dims(&[5, 3, 2]);
        assert_eq!(hc.lineal_index(&[3, 1, 0]), 8);
        assert_eq!(hc.split_index(8), vec![3, 1, 0]);
        assert_eq!(hc.lineal_index(&[0, 0, 1]), 15);
    }

    #[test]
    fn duplicate_axis_names_detected() {
        let hc = Hypercube::new(vec![str_axis("x", &["a"]), str_axis("x", &["b"])]);
        assert!(!hc.dims_are_distinct());
    }

    #[test]
    fn union_intersects_string_axes() {
        let mut result = Hypercube::new(vec![str_axis("x", &["a", "b", "c"])]);
        let other = Hypercube::new(vec![str_axis("x", &["b", "c", "d"])]);
        union_hc(&mut result, &other, false);
        assert_eq!(
            result.xvectors[0].entries(),
            &[Value::from("b"), Value::from("c")]
        );
    }

    #[test]
    fn union_merges_numeric_axes_and_appends_extras() {
        let mut result = Hypercube::new(vec![num_axis("x", &[1.0, 3.0])]);
        let other = Hypercube::new(vec![num_axis("x", &[2.0, 4.0]), str_axis("y", &["p"])]);
        union_hc(&mut result, &other, false);
        assert_eq!(
            result.xvectors[0].entries(),
            &[
                Value::Num(1.0),
                Value::Num(2.0),
                Value::Num(3.0),
                Value::Num(4.0)
            ]
        );
        assert_eq!(result.xvectors[1].name, "y");
    }

    #[test]
    fn intersection_clamps_numeric_axes_to_overlap() {
        let mut result = Hypercube::new(vec![num_axis("x", &[1.0, 2.0, 5.0])]);
        let other = Hypercube::new(vec![num_axis("x", &[2.0, 3.0, 9.0])]);
        union_hc(&mut result, &other, true);
        // overlap is [2, 5]: keeps 2 and 5 from result, pulls in 3 from other
        assert_eq!(
            result.xvectors[0].entries(),
            &[Value::Num(2.0), Value::Num(3.0), Value::Num(5.0)]
        );
    }

    #[test]
    fn empty_other_clears_result_in_intersection_mode() {
        let mut result = Hypercube::new(vec![num_axis("x", &[1.0])]);
        let other = Hypercube::new(vec![num_axis("x", &[])]);
        union_hc(&mut result, &other, true);
        assert!(result.xvectors.is_empty());

        let mut result = Hypercube::new(vec![num_axis("x", &[1.0])]);
        union_hc(&mut result, &other, false);
        assert_eq!(result.rank(), 1);
    }

    #[test]
    fn index_dense_identity_and_offsets() {
        let idx = Index::new();
        assert!(idx.is_empty());
        assert_eq!(idx.get(7), 7);

        let idx = Index::from(BTreeSet::from([1usize, 4, 8, 12]));
        assert_eq!(idx.len(), 4);
        assert_eq!(idx.get(2), 8);
        assert_eq!(idx.lineal_offset(8), 2);
        assert_eq!(idx.lineal_offset(9), idx.len());
        assert!(idx.is_sorted_unique());
    }

    #[test]
    fn index_from_map_keys() {
        let map = BTreeMap::from([(3usize, "x"), (1, "y"), (9, "z")]);
        let idx = Index::from(&map);
        assert_eq!(idx.positions(), &[1, 3, 9]);
    }

    proptest! {
        #[test]
        fn prop_split_lineal_roundtrip(dims in prop::collection::vec(1usize..=6, 1..=4), seed in 0usize..10_000) {
            let hc = Hypercube::from_dims(&dims);
            let h = seed % hc.num_elements();
            let split = hc.split_index(h);
            prop_assert_eq!(split.len(), hc.rank());
            for (coord, dim) in split.iter().zip(&dims) {
                prop_assert!(coord < dim);
            }
            prop_assert_eq!(hc.lineal_index(&split), h);
        }

        #[test]
        fn prop_index_offset_membership(raw in prop::collection::btree_set(0usize..500, 1..40), probe in 0usize..500) {
            let idx = Index::from(raw.clone());
            prop_assert!(idx.is_sorted_unique());
            let offset = idx.lineal_offset(probe);
            if raw.contains(&probe) {
                prop_assert!(offset < idx.len());
                prop_assert_eq!(idx.get(offset), probe);
            } else {
                prop_assert_eq!(offset, idx.len());
            }
        }
    }
}
