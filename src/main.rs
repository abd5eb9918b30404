use clap::Parser;
use log::{debug, error, info, warn};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::hash_map::Entry;
use std::fs;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Parser)]
#[command(name = "cladoprep")]
#[command(about = "Prepare and render a circular cladogram from a lineage abundance table.", long_about = None)]
struct Args {
    // MANDATORY OPTIONS
    /// Load the lineage abundance table (TSV, header `ID<TAB>sample...`) from this FILE.
    #[arg(short = 'i', long = "abundance", value_name = "FILE")]
    abundance: PathBuf,

    /// Write the rendered cladogram image to this FILE.
    #[arg(short = 'o', long = "out", value_name = "FILE")]
    out: PathBuf,

    /// Renderer style FILE (must already exist).
    #[arg(short = 'y', long = "style", value_name = "FILE")]
    style: PathBuf,

    /// Path to the external circular-tree renderer script.
    #[arg(long = "script", value_name = "FILE", default_value = "circlader.py")]
    script: PathBuf,

    // Renderer Input Files (derived from --out when omitted)
    /// Write tree structure records to this FILE.
    #[arg(long = "tree-file", value_name = "FILE")]
    tree_file: Option<PathBuf>,

    /// Write color records to this FILE.
    #[arg(long = "color-file", value_name = "FILE")]
    color_file: Option<PathBuf>,

    /// Write tick records to this FILE.
    #[arg(long = "tick-file", value_name = "FILE")]
    tick_file: Option<PathBuf>,

    /// Write highlight records to this FILE.
    #[arg(long = "highlight-file", value_name = "FILE")]
    highlight_file: Option<PathBuf>,

    /// Write node size records to this FILE.
    #[arg(long = "size-file", value_name = "FILE")]
    size_file: Option<PathBuf>,

    /// Write circle band records to this FILE.
    #[arg(long = "circle-file", value_name = "FILE")]
    circle_file: Option<PathBuf>,

    // Lineage Options
    /// Keep only lineages with at most N ancestry levels.
    #[arg(short = 't', long = "terminal-level", value_name = "N", default_value_t = 10)]
    terminal_level: usize,

    /// Delimiter separating ancestry labels in lineage identifiers.
    #[arg(short = 'd', long = "delimiter", value_name = "CHAR", default_value_t = '|')]
    delimiter: char,

    /// Label marking unclassified terminal nodes.
    #[arg(long = "unclassified", value_name = "STRING", default_value = "unclassified")]
    unclassified: String,

    /// Re-root the tree at this ancestry label, discarding unrelated branches.
    #[arg(short = 'r', long = "root", value_name = "LABEL")]
    root: Option<String>,

    // Abundance Filter Options
    /// Filter lineages by per-sample abundance percentile.
    #[arg(short = 'f', long = "filter-abundance")]
    filter_abundance: bool,

    /// Percentile that sets each sample's abundance threshold.
    #[arg(long = "percentile", value_name = "FLOAT", default_value_t = 90.0)]
    percentile: f64,

    /// Percentage of samples that must meet their threshold for a lineage to be kept.
    #[arg(long = "percent-above", value_name = "FLOAT", default_value_t = 1.0)]
    percent_above: f64,

    // Clade Size Filter Options
    /// Filter out clades with too few terminal descendants.
    #[arg(short = 'c', long = "filter-clade-size")]
    filter_clade_size: bool,

    /// Ancestry depth at which a clade is counted (1-based).
    #[arg(long = "measure-level", value_name = "N", default_value_t = 3)]
    measure_level: usize,

    /// Ancestry depth the counting prefix is truncated to (must be <= measure level).
    #[arg(long = "reduce-level", value_name = "N", default_value_t = 1)]
    reduce_level: usize,

    /// Minimum terminal descendants for a clade to be kept.
    #[arg(long = "min-clade-size", value_name = "N", default_value_t = 5)]
    min_clade_size: usize,

    // Annotation Options
    /// Read color assignments (key<TAB>R,G,B or key<TAB>#rrggbb) from FILE.
    #[arg(long = "colors", value_name = "FILE")]
    colors: Option<PathBuf>,

    /// Read tick levels (level<TAB>name) from FILE.
    #[arg(long = "ticks", value_name = "FILE")]
    ticks: Option<PathBuf>,

    /// Read forced highlights (lineage<TAB>colorKey) from FILE.
    #[arg(long = "highlights", value_name = "FILE")]
    highlights: Option<PathBuf>,

    /// Read label replacements (label<TAB>newLabel) from FILE.
    #[arg(long = "relabels", value_name = "FILE")]
    relabels: Option<PathBuf>,

    /// Read circle bands (name<TAB>taxa[<TAB>alpha[<TAB>shape[<TAB>border[<TAB>forced]]]]) from FILE.
    #[arg(long = "circles", value_name = "FILE")]
    circles: Option<PathBuf>,

    // Node Size Options
    /// Linear magnification applied to log-scaled node sizes.
    #[arg(long = "circle-scale", value_name = "FLOAT", default_value_t = 3.0)]
    circle_scale: f64,

    /// Multiplier applied to mean abundance before the log transform.
    #[arg(long = "log-scale", value_name = "FLOAT", default_value_t = 1_000_000.0)]
    log_scale: f64,

    /// Smallest mean abundance representable on the log scale.
    #[arg(long = "min-log-size", value_name = "FLOAT", default_value_t = 1e-10)]
    min_log_size: f64,

    // Invocation
    /// Write the renderer input files but do not invoke the renderer.
    #[arg(long = "skip-render")]
    skip_render: bool,

    // Logging
    /// Verbosity level (0 = error, 1 = info, 2 = debug).
    #[arg(short = 'v', long = "verbose", value_name = "N", default_value_t = 1)]
    verbose: u8,
}

/// Color key every color map must carry for the renderer background.
const BACKGROUND_COLOR_KEY: &str = "Background";
const BACKGROUND_COLOR: &str = "255,255,255";

/// Circlader color code emitted when a key cannot be resolved.
const UNRESOLVED_COLOR: &str = "_c_[1,1,1]";

/// Insertion-ordered set of lineage identifiers.
///
/// The pipeline repeatedly merges and deduplicates identifier collections;
/// keeping explicit insertion order makes every output file deterministic.
#[derive(Debug, Default)]
struct OrderedSet {
    items: Vec<String>,
    seen: FxHashSet<String>,
}

impl OrderedSet {
    fn new() -> Self {
        OrderedSet {
            items: Vec::new(),
            seen: FxHashSet::default(),
        }
    }

    /// Insert a value, returning false if it was already present.
    fn insert(&mut self, value: String) -> bool {
        if self.seen.contains(&value) {
            return false;
        }
        self.seen.insert(value.clone());
        self.items.push(value);
        true
    }

    fn contains(&self, value: &str) -> bool {
        self.seen.contains(value)
    }

    fn as_slice(&self) -> &[String] {
        &self.items
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

impl FromIterator<String> for OrderedSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        let mut set = OrderedSet::new();
        for value in iter {
            set.insert(value);
        }
        set
    }
}

/// A circle band attribute: one value for the whole band, or one per taxon.
#[derive(Debug, Clone)]
enum BandValue<T> {
    Uniform(T),
    PerTaxon(Vec<T>),
}

impl<T: Clone> BandValue<T> {
    /// Resolve the value for the taxon at `index`.
    fn at(&self, index: usize) -> &T {
        match self {
            BandValue::Uniform(value) => value,
            BandValue::PerTaxon(values) => &values[index],
        }
    }

    /// Per-taxon lists must match the taxa list length exactly.
    fn len_matches(&self, taxa_len: usize) -> bool {
        match self {
            BandValue::Uniform(_) => true,
            BandValue::PerTaxon(values) => values.len() == taxa_len,
        }
    }

    /// Keep only the entries at `indices` (identity for uniform values).
    fn select(&self, indices: &[usize]) -> BandValue<T> {
        match self {
            BandValue::Uniform(value) => BandValue::Uniform(value.clone()),
            BandValue::PerTaxon(values) => {
                BandValue::PerTaxon(indices.iter().map(|&index| values[index].clone()).collect())
            }
        }
    }
}

/// An annotation ring around the cladogram: taxa plus their shape, border
/// width, and transparency, optionally forced past the filters.
#[derive(Debug, Clone)]
struct CircleBand {
    taxa: Vec<String>,
    name: String,
    border: BandValue<f64>,
    shape: BandValue<String>,
    alpha: BandValue<f64>,
    forced: bool,
}

impl CircleBand {
    /// Per-taxon attribute lists must line up with the taxa list.
    fn validate(&self) -> Result<(), String> {
        let taxa_len = self.taxa.len();
        if !self.shape.len_matches(taxa_len) {
            return Err(format!(
                "circle '{}': shape list does not match its {} taxa",
                self.name, taxa_len
            ));
        }
        if !self.border.len_matches(taxa_len) {
            return Err(format!(
                "circle '{}': border list does not match its {} taxa",
                self.name, taxa_len
            ));
        }
        if !self.alpha.len_matches(taxa_len) {
            return Err(format!(
                "circle '{}': alpha list does not match its {} taxa",
                self.name, taxa_len
            ));
        }
        Ok(())
    }

    /// Rewrite the band's taxa relative to the context root, keeping any
    /// per-taxon attribute lists in lock-step with the surviving taxa.
    fn rebase(&self, ctx: &LineageContext) -> CircleBand {
        let root = match &ctx.root {
            Some(root) => root,
            None => return self.clone(),
        };
        let mut taxa = Vec::new();
        let mut kept = Vec::new();
        for (index, taxon) in self.taxa.iter().enumerate() {
            if let Some(rebased) = rebase_one(taxon, root, ctx.delimiter) {
                taxa.push(rebased);
                kept.push(index);
            }
        }
        CircleBand {
            taxa,
            name: self.name.clone(),
            border: self.border.select(&kept),
            shape: self.shape.select(&kept),
            alpha: self.alpha.select(&kept),
            forced: self.forced,
        }
    }
}

/// One lineage row of per-sample abundance measurements.
#[derive(Debug, Clone)]
struct AbundanceRow {
    id: String,
    values: Vec<f64>,
}

/// Lineage-by-sample abundance matrix.
///
/// Rows and sample names are positionally coupled; the constructor rejects
/// any row whose measurement count differs from the sample count so that
/// coupling holds everywhere downstream.
#[derive(Debug, Clone)]
struct AbundanceTable {
    sample_names: Vec<String>,
    rows: Vec<AbundanceRow>,
}

impl AbundanceTable {
    fn new(sample_names: Vec<String>, rows: Vec<AbundanceRow>) -> Result<Self, String> {
        for row in &rows {
            if row.values.len() != sample_names.len() {
                return Err(format!(
                    "row '{}' has {} measurements for {} samples",
                    row.id,
                    row.values.len(),
                    sample_names.len()
                ));
            }
        }
        Ok(AbundanceTable { sample_names, rows })
    }

    /// Parse a TSV abundance table: header `ID<TAB>sample...`, then one
    /// lineage per line with numeric measurements.
    fn from_tsv(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);

        let mut sample_names: Option<Vec<String>> = None;
        let mut rows = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parts: Vec<&str> = line.split('\t').collect();
            if sample_names.is_none() {
                sample_names = Some(parts[1..].iter().map(|name| name.to_string()).collect());
                continue;
            }
            let mut values = Vec::with_capacity(parts.len().saturating_sub(1));
            for field in &parts[1..] {
                match field.trim().parse::<f64>() {
                    Ok(value) => values.push(value),
                    Err(_) => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("non-numeric measurement '{}' for row '{}'", field, parts[0]),
                        ));
                    }
                }
            }
            rows.push(AbundanceRow {
                id: parts[0].to_string(),
                values,
            });
        }

        let sample_names = sample_names.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "abundance table has no header line")
        })?;
        AbundanceTable::new(sample_names, rows)
            .map_err(|message| io::Error::new(io::ErrorKind::InvalidData, message))
    }
}

/// Immutable per-generation settings threaded through every filtering and
/// rebasing step.
#[derive(Debug, Clone)]
struct LineageContext {
    delimiter: char,
    root: Option<String>,
    unclassified: String,
}

/// Abundance percentile filter settings.
#[derive(Debug, Clone)]
struct AbundanceFilter {
    percentile_cutoff: f64,
    percent_above: f64,
}

impl Default for AbundanceFilter {
    fn default() -> Self {
        AbundanceFilter {
            percentile_cutoff: 90.0,
            percent_above: 1.0,
        }
    }
}

/// Clade size filter settings (levels are 1-based ancestry depths).
#[derive(Debug, Clone)]
struct CladeSizeFilter {
    measure_level: usize,
    reduce_level: usize,
    min_clade_size: usize,
}

impl Default for CladeSizeFilter {
    fn default() -> Self {
        CladeSizeFilter {
            measure_level: 3,
            reduce_level: 1,
            min_clade_size: 5,
        }
    }
}

/// Split a lineage identifier into its ancestry labels, discarding empty
/// segments left by leading or trailing delimiters.
fn split_lineage(id: &str, delimiter: char) -> Vec<&str> {
    id.split(delimiter).filter(|label| !label.is_empty()).collect()
}

/// `.`-joined display form of a lineage identifier.
fn display_path(id: &str, delimiter: char) -> String {
    split_lineage(id, delimiter).join(".")
}

/// Display label for a terminal node. Unclassified terminals borrow their
/// parent label (`parent.unclassified`) so otherwise-identical leaves stay
/// distinguishable.
fn display_terminal(id: &str, delimiter: char, unclassified: &str) -> String {
    let labels = split_lineage(id, delimiter);
    match labels.split_last() {
        None => String::new(),
        Some((last, rest)) => {
            if *last == unclassified && !rest.is_empty() {
                format!("{}.{}", rest[rest.len() - 1], last)
            } else {
                (*last).to_string()
            }
        }
    }
}

/// Expand a set of lineage identifiers into the full set of their
/// proper-prefix ancestors, `.`-joined, insertion-ordered, duplicate-free.
fn build_tree_closure(ids: &[String], delimiter: char) -> Vec<String> {
    let mut closure = Vec::new();
    let mut seen: FxHashSet<String> = FxHashSet::default();
    for id in ids {
        let labels = split_lineage(id, delimiter);
        for depth in 1..=labels.len() {
            let node = labels[..depth].join(".");
            if seen.insert(node.clone()) {
                closure.push(node);
            }
        }
    }
    closure
}

/// Identifiers that are not a proper prefix of any other identifier in the
/// collection, which makes them the leaves of the candidate tree.
fn terminal_nodes(ids: &[String], delimiter: char) -> Vec<String> {
    let separator = delimiter.to_string();
    let mut ancestors: FxHashSet<String> = FxHashSet::default();
    for id in ids {
        let labels = split_lineage(id, delimiter);
        for depth in 1..labels.len() {
            ancestors.insert(labels[..depth].join(&separator));
        }
    }
    ids.iter()
        .filter(|id| !ancestors.contains(id.as_str()))
        .cloned()
        .collect()
}

/// Score at the given percentile with linear interpolation between the
/// closest ranks.
fn score_at_percentile(values: &mut [f64], percentile: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();
    if n == 1 {
        return values[0];
    }
    let rank = ((percentile / 100.0) * (n - 1) as f64).clamp(0.0, (n - 1) as f64);
    let low = rank.floor() as usize;
    let fraction = rank - low as f64;
    if fraction == 0.0 || low + 1 >= n {
        values[low]
    } else {
        values[low] + (values[low + 1] - values[low]) * fraction
    }
}

/// Keep identifiers whose measurement meets its sample's percentile
/// threshold in at least `percent_above` percent of the samples.
///
/// Thresholds are computed per sample across every table row; candidate
/// membership only decides which rows may be returned.
fn filter_by_abundance(
    table: &AbundanceTable,
    ids: &[String],
    filter: &AbundanceFilter,
) -> Vec<String> {
    let sample_count = table.sample_names.len();
    if sample_count == 0 {
        warn!("abundance table has no samples, abundance filter keeps nothing");
        return Vec::new();
    }

    let thresholds: Vec<f64> = (0..sample_count)
        .into_par_iter()
        .map(|sample| {
            let mut column: Vec<f64> = table.rows.iter().map(|row| row.values[sample]).collect();
            score_at_percentile(&mut column, filter.percentile_cutoff)
        })
        .collect();

    let candidates: FxHashSet<&str> = ids.iter().map(String::as_str).collect();
    let needed_fraction = filter.percent_above / 100.0;

    let mut kept = Vec::new();
    for row in &table.rows {
        if !candidates.contains(row.id.as_str()) {
            continue;
        }
        let mut above = 0usize;
        for (sample, value) in row.values.iter().enumerate() {
            if *value >= thresholds[sample] {
                above += 1;
            }
        }
        if above as f64 / sample_count as f64 >= needed_fraction {
            kept.push(row.id.clone());
        }
    }
    kept
}

/// Keep identifiers whose clade has enough terminal descendants.
///
/// Pass one counts terminals per `reduce_level` prefix; pass two keeps each
/// candidate whose prefix count reaches `min_clade_size`. Both passes measure
/// each identifier's own ancestry depth, and identifiers shorter than
/// `reduce_level` always pass through.
fn filter_by_clade_size(
    ids: &[String],
    filter: &CladeSizeFilter,
    ctx: &LineageContext,
) -> Vec<String> {
    let separator = ctx.delimiter.to_string();

    let mut clade_counts: FxHashMap<String, usize> = FxHashMap::default();
    for node in terminal_nodes(ids, ctx.delimiter) {
        let labels = split_lineage(&node, ctx.delimiter);
        let depth = labels.len();
        if depth >= filter.reduce_level
            && (depth >= filter.measure_level
                || labels.last().copied() == Some(ctx.unclassified.as_str()))
        {
            let key = labels[..filter.reduce_level].join(&separator);
            *clade_counts.entry(key).or_insert(0) += 1;
        }
    }

    let mut kept = Vec::new();
    for id in ids {
        let labels = split_lineage(id, ctx.delimiter);
        let depth = labels.len();
        if depth < filter.reduce_level {
            kept.push(id.clone());
        } else if depth >= filter.measure_level
            || labels.last().copied() == Some(ctx.unclassified.as_str())
        {
            let key = labels[..filter.reduce_level].join(&separator);
            if clade_counts.get(&key).copied().unwrap_or(0) >= filter.min_clade_size {
                kept.push(id.clone());
            }
        }
    }
    kept
}

/// Rewrite one identifier relative to `root`: everything up to and including
/// the root label is discarded, deeper levels merge under the new top level.
/// Identifiers that do not contain the root, or whose terminal is the root
/// itself, belong to no branch of the rebased tree and are dropped.
fn rebase_one(id: &str, root: &str, delimiter: char) -> Option<String> {
    let labels = split_lineage(id, delimiter);
    let position = labels.iter().position(|label| *label == root)?;
    let rest = &labels[position + 1..];
    if rest.is_empty() {
        None
    } else {
        Some(rest.join(&delimiter.to_string()))
    }
}

/// Rebase a whole identifier collection; a pass-through when no root is set.
fn rebase_ids(ids: &[String], ctx: &LineageContext) -> Vec<String> {
    match &ctx.root {
        None => ids.to_vec(),
        Some(root) => ids
            .iter()
            .filter_map(|id| rebase_one(id, root, ctx.delimiter))
            .collect(),
    }
}

/// Rebase every key of an annotation map, dropping keys outside the rebased
/// tree so the channel stays addressable under the new rooting.
fn rebase_map_keys(
    map: FxHashMap<String, String>,
    ctx: &LineageContext,
) -> FxHashMap<String, String> {
    let root = match &ctx.root {
        Some(root) => root,
        None => return map,
    };
    map.into_iter()
        .filter_map(|(key, value)| {
            rebase_one(&key, root, ctx.delimiter).map(|rebased| (rebased, value))
        })
        .collect()
}

/// Display label per identifier: disambiguated terminal label, then any
/// caller-supplied relabel.
fn generate_labels(
    ids: &[String],
    relabels: Option<&FxHashMap<String, String>>,
    ctx: &LineageContext,
) -> FxHashMap<String, String> {
    let mut labels = FxHashMap::default();
    for id in ids {
        let mut label = display_terminal(id, ctx.delimiter, &ctx.unclassified);
        if let Some(map) = relabels {
            if let Some(replacement) = map.get(&label) {
                label = replacement.clone();
            }
        }
        labels.insert(id.clone(), label);
    }
    labels
}

/// Format a float the way the renderer grammar expects: whole numbers keep
/// one decimal place (`1.0`), everything else prints as-is.
fn format_float(value: f64) -> String {
    if value.is_finite() && value == value.trunc() {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

/// Convert an `R,G,B` (0-255) string to the renderer's `_c_[r,g,b]` code
/// with channels normalized to 0-1. Unresolvable input gets the default.
fn format_rgb(color: Option<&str>) -> String {
    if let Some(color) = color {
        let channels: Vec<&str> = color
            .split(',')
            .map(str::trim)
            .filter(|field| !field.is_empty())
            .collect();
        if channels.len() == 3 {
            let parsed: Vec<u32> = channels
                .iter()
                .filter_map(|field| field.parse::<u32>().ok())
                .collect();
            if parsed.len() == 3 {
                return format!(
                    "_c_[{},{},{}]",
                    format_float(parsed[0] as f64 / 255.0),
                    format_float(parsed[1] as f64 / 255.0),
                    format_float(parsed[2] as f64 / 255.0)
                );
            }
        }
    }
    UNRESOLVED_COLOR.to_string()
}

/// Append `circle_name` to the tick list at the next unused level unless it
/// is already listed.
fn extend_ticks(ticks: &mut Vec<(String, String)>, circle_name: &str) {
    if ticks.iter().any(|(_, name)| name == circle_name) {
        return;
    }
    let highest = ticks
        .iter()
        .filter_map(|(level, _)| level.parse::<i64>().ok())
        .max()
        .unwrap_or(-1);
    ticks.push(((highest + 1).to_string(), circle_name.to_string()));
}

/// Compose the circle file: one row per taxon touched by any band, with one
/// `name:alpha!shape#border` fragment per declared band (a neutral fragment
/// for bands not covering that taxon). Returns None when there is nothing to
/// write. Bands must have been validated beforehand.
fn create_circle_content(
    bands: &[CircleBand],
    ticks: &mut Option<Vec<(String, String)>>,
    ctx: &LineageContext,
) -> Option<String> {
    if bands.is_empty() {
        return None;
    }
    let rebased: Vec<CircleBand> = bands.iter().map(|band| band.rebase(ctx)).collect();

    if let Some(ticks) = ticks {
        for band in &rebased {
            extend_ticks(ticks, &band.name);
        }
    }

    let mut order = OrderedSet::new();
    for band in &rebased {
        for taxon in &band.taxa {
            order.insert(taxon.clone());
        }
    }
    if order.as_slice().is_empty() {
        return None;
    }

    // First position wins when a band lists the same taxon twice.
    let indices: Vec<FxHashMap<&str, usize>> = rebased
        .iter()
        .map(|band| {
            let mut index: FxHashMap<&str, usize> = FxHashMap::default();
            for (position, taxon) in band.taxa.iter().enumerate() {
                index.entry(taxon.as_str()).or_insert(position);
            }
            index
        })
        .collect();

    let mut lines = Vec::new();
    for taxon in order.as_slice() {
        let mut fields = vec![display_path(taxon, ctx.delimiter)];
        for (band, index) in rebased.iter().zip(&indices) {
            let fragment = match index.get(taxon.as_str()) {
                Some(&position) => format!(
                    "{}:{}!{}#{}",
                    band.name,
                    format_float(*band.alpha.at(position)),
                    band.shape.at(position),
                    format_float(*band.border.at(position))
                ),
                None => format!("{}:0.0!R#0.0", band.name),
            };
            fields.push(fragment);
        }
        lines.push(fields.join("\t"));
    }
    Some(lines.join("\n"))
}

/// Compose highlight rows for retained identifiers with a forced highlight:
/// `displayPath<TAB>label<TAB>label<TAB>circladerColor`. Without a relabel
/// the first label is the disambiguated terminal and the second stays empty.
fn highlight_rows(
    ids: &[String],
    highlights: &FxHashMap<String, String>,
    colors: Option<&FxHashMap<String, String>>,
    relabels: Option<&FxHashMap<String, String>>,
    ctx: &LineageContext,
) -> Vec<String> {
    let mut rows = Vec::new();
    for id in ids {
        let color_key = match highlights.get(id) {
            Some(key) => key,
            None => continue,
        };
        let path = display_path(id, ctx.delimiter);
        let terminal = display_terminal(id, ctx.delimiter, &ctx.unclassified);
        let color = format_rgb(
            colors
                .and_then(|map| map.get(color_key))
                .map(String::as_str),
        );
        match relabels.and_then(|map| map.get(&terminal)) {
            Some(label) => rows.push(format!("{}\t{}\t{}\t{}", path, label, label, color)),
            None => rows.push(format!("{}\t{}\t\t{}", path, terminal, color)),
        }
    }
    rows
}

/// Compose the size file: retained identifiers get the log-scaled display
/// size of their mean abundance.
fn size_content(
    table: &AbundanceTable,
    retained: &OrderedSet,
    ctx: &LineageContext,
    min_log_size: f64,
    log_scale: f64,
    circle_scale: f64,
) -> String {
    let floor = min_log_size * log_scale + 1.0;
    let mut lines = Vec::new();
    for row in &table.rows {
        let id = match &ctx.root {
            None => row.id.clone(),
            Some(root) => match rebase_one(&row.id, root, ctx.delimiter) {
                Some(rebased) => rebased,
                None => continue,
            },
        };
        if !retained.contains(&id) || row.values.is_empty() {
            continue;
        }
        let mean = row.values.iter().sum::<f64>() / row.values.len() as f64;
        let size = (mean * log_scale + 1.0).max(floor);
        lines.push(format!(
            "{}\t{}",
            display_path(&id, ctx.delimiter),
            size.log10() * circle_scale
        ));
    }
    lines.join("\n")
}

/// Paths involved in one generation run.
#[derive(Debug, Clone)]
struct OutputFiles {
    image: PathBuf,
    style: PathBuf,
    script: PathBuf,
    tree: PathBuf,
    color: PathBuf,
    tick: PathBuf,
    highlight: PathBuf,
    size: PathBuf,
    circle: PathBuf,
}

/// Which optional renderer inputs were actually produced.
#[derive(Debug, Default)]
struct MadeFiles {
    size: bool,
    color: bool,
    tick: bool,
    highlight: bool,
    circle: bool,
}

/// Check the style file exists and clear stale copies of the files this run
/// will write.
fn manage_file_paths(files: &OutputFiles) -> bool {
    if !files.style.exists() {
        error!("style file {} does not exist", files.style.display());
        return false;
    }
    for path in [
        &files.tree,
        &files.color,
        &files.tick,
        &files.highlight,
        &files.size,
        &files.circle,
    ] {
        if path.exists() {
            if let Err(err) = fs::remove_file(path) {
                warn!("could not remove stale file {}: {}", path.display(), err);
            }
        }
    }
    true
}

/// Overwrite `path` with `content` (no trailing newline is appended).
fn write_to_file(path: &Path, content: &str) -> io::Result<()> {
    fs::write(path, content)
}

/// Invoke the external renderer on the generated files. Optional channel
/// flags are passed only for files that were actually produced.
fn run_renderer(files: &OutputFiles, made: &MadeFiles) -> bool {
    let mut command = Command::new(&files.script);
    command
        .arg(&files.tree)
        .arg(&files.image)
        .arg("--style_file")
        .arg(&files.style)
        .arg("--tree_format")
        .arg("tabular");
    if made.size {
        command.arg("--size_file").arg(&files.size);
    }
    if made.color {
        command.arg("--color_file").arg(&files.color);
    }
    if made.tick {
        command.arg("--tick_file").arg(&files.tick);
    }
    if made.highlight {
        command.arg("--highlight_file").arg(&files.highlight);
    }
    if made.circle {
        command.arg("--circle_file").arg(&files.circle);
    }

    info!("Invoking renderer {}...", files.script.display());
    match command.status() {
        Ok(status) if status.success() => true,
        Ok(status) => {
            error!("renderer exited with {}", status);
            false
        }
        Err(err) => {
            error!("failed to launch renderer {}: {}", files.script.display(), err);
            false
        }
    }
}

/// One cladogram generation session: the abundance snapshot plus every
/// annotation channel, owned by a single caller for one run.
struct Cladogram {
    abundance: Option<AbundanceTable>,
    colors: Option<FxHashMap<String, String>>,
    forced_highlights: FxHashMap<String, String>,
    relabels: Option<FxHashMap<String, String>>,
    ticks: Option<Vec<(String, String)>>,
    circles: Vec<CircleBand>,
    root: Option<String>,
    delimiter: char,
    unclassified: String,
    abundance_filter: Option<AbundanceFilter>,
    clade_size_filter: Option<CladeSizeFilter>,
    min_log_size: f64,
    log_scale: f64,
    circle_scale: f64,
    labels: FxHashMap<String, String>,
}

impl Cladogram {
    /// Fresh session with independent annotation containers.
    fn new() -> Self {
        Cladogram {
            abundance: None,
            colors: None,
            forced_highlights: FxHashMap::default(),
            relabels: None,
            ticks: None,
            circles: Vec::new(),
            root: None,
            delimiter: '|',
            unclassified: "unclassified".to_string(),
            abundance_filter: None,
            clade_size_filter: None,
            min_log_size: 1e-10,
            log_scale: 1_000_000.0,
            circle_scale: 3.0,
            labels: FxHashMap::default(),
        }
    }

    fn set_abundance(&mut self, table: AbundanceTable) {
        self.abundance = Some(table);
    }

    /// Add forced highlights (lineage -> color key). Entries added here skip
    /// abundance and clade-size filtering. Existing keys are updated only
    /// when `overwrite` is set; nothing is ever deleted.
    fn add_highlights(&mut self, highlights: FxHashMap<String, String>, overwrite: bool) {
        for (key, color_key) in highlights {
            match self.forced_highlights.entry(key) {
                Entry::Occupied(mut entry) => {
                    if overwrite {
                        entry.insert(color_key);
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(color_key);
                }
            }
        }
    }

    fn highlights(&self) -> &FxHashMap<String, String> {
        &self.forced_highlights
    }

    /// Root the tree at the given ancestry label; lineages not containing it
    /// are discarded during generation.
    fn force_root(&mut self, root: String) {
        self.root = Some(root);
    }

    /// Replace the color map. The background key is filled in with its
    /// default when absent.
    fn set_colors(&mut self, mut colors: FxHashMap<String, String>) {
        colors
            .entry(BACKGROUND_COLOR_KEY.to_string())
            .or_insert_with(|| BACKGROUND_COLOR.to_string());
        self.colors = Some(colors);
    }

    /// Replace the tick list: (level, circle name) pairs, lowest level
    /// closest to the center.
    fn set_ticks(&mut self, ticks: Vec<(String, String)>) {
        self.ticks = Some(ticks);
    }

    /// Replace the relabel map (terminal label -> display label).
    fn relabel_ids(&mut self, relabels: FxHashMap<String, String>) {
        self.relabels = Some(relabels);
    }

    /// Append a circle band. Validation happens at emission time.
    fn add_circle(&mut self, band: CircleBand) {
        self.circles.push(band);
    }

    fn set_abundance_filter(&mut self, filter: Option<AbundanceFilter>) {
        self.abundance_filter = filter;
    }

    fn set_clade_size_filter(&mut self, filter: Option<CladeSizeFilter>) {
        self.clade_size_filter = filter;
    }

    fn set_feature_delimiter(&mut self, delimiter: char) {
        self.delimiter = delimiter;
    }

    fn set_unclassified_label(&mut self, label: String) {
        self.unclassified = label;
    }

    fn set_circle_scale(&mut self, scale: f64) {
        self.circle_scale = scale;
    }

    fn set_size_scaling(&mut self, log_scale: f64, min_log_size: f64) {
        self.log_scale = log_scale;
        self.min_log_size = min_log_size;
    }

    /// Display labels computed during the last generation run.
    fn labels(&self) -> &FxHashMap<String, String> {
        &self.labels
    }

    /// Run the whole pipeline and write the renderer input files, then
    /// invoke the renderer unless `skip_render` is set. Returns false when a
    /// structural channel (tree, circle, highlight, size) or the renderer
    /// fails; cosmetic channels (color, tick) degrade by omission.
    fn generate(&mut self, files: &OutputFiles, terminal_level: usize, skip_render: bool) -> bool {
        let all_ids: Vec<String> = match &self.abundance {
            Some(table) => table.rows.iter().map(|row| row.id.clone()).collect(),
            None => {
                error!("no abundance data set, nothing to plot");
                return false;
            }
        };

        if !manage_file_paths(files) {
            return false;
        }

        let ctx = LineageContext {
            delimiter: self.delimiter,
            root: self.root.clone(),
            unclassified: self.unclassified.clone(),
        };

        self.labels = generate_labels(&all_ids, self.relabels.as_ref(), &ctx);

        // Lineages deeper than the terminal display level never take part.
        let total = all_ids.len();
        let mut ids: Vec<String> = all_ids
            .into_iter()
            .filter(|id| split_lineage(id, ctx.delimiter).len() <= terminal_level)
            .collect();
        info!(
            "{} of {} lineages at or above terminal level {}",
            ids.len(),
            total,
            terminal_level
        );

        if let Some(filter) = &self.abundance_filter {
            if let Some(table) = &self.abundance {
                let before = ids.len();
                ids = filter_by_abundance(table, &ids, filter);
                info!("Abundance filter kept {} of {} lineages", ids.len(), before);
            }
        }

        let mut ids = rebase_ids(&ids, &ctx);
        if let Some(root) = &ctx.root {
            info!("Rebased to root '{}': {} lineages kept", root, ids.len());
            let highlights = std::mem::take(&mut self.forced_highlights);
            self.forced_highlights = rebase_map_keys(highlights, &ctx);
            if let Some(relabels) = self.relabels.take() {
                self.relabels = Some(rebase_map_keys(relabels, &ctx));
            }
        }

        // Applied last among the filters so it cannot interact with the
        // abundance rule.
        if let Some(filter) = &self.clade_size_filter {
            let before = ids.len();
            ids = filter_by_clade_size(&ids, filter, &ctx);
            info!("Clade size filter kept {} of {} lineages", ids.len(), before);
        }

        let mut retained: OrderedSet = ids.into_iter().collect();

        let mut forced_keys: Vec<String> = self.forced_highlights.keys().cloned().collect();
        forced_keys.sort();
        for key in forced_keys {
            retained.insert(key);
        }

        for band in &self.circles {
            if let Err(message) = band.validate() {
                error!("{}", message);
                return false;
            }
        }

        // Forced circle taxa with a visible alpha are rendered no matter
        // what the filters decided.
        for band in &self.circles {
            if !band.forced {
                continue;
            }
            let rebased = band.rebase(&ctx);
            for (index, taxon) in rebased.taxa.iter().enumerate() {
                if *rebased.alpha.at(index) != 0.0 {
                    retained.insert(taxon.clone());
                }
            }
        }

        let mut made = MadeFiles::default();

        if let Some(content) = create_circle_content(&self.circles, &mut self.ticks, &ctx) {
            if let Err(err) = write_to_file(&files.circle, &content) {
                error!("failed writing circle file {}: {}", files.circle.display(), err);
                return false;
            }
            made.circle = true;
        }

        let closure = build_tree_closure(retained.as_slice(), ctx.delimiter);
        if closure.is_empty() {
            error!("no lineages survived filtering, the tree would be empty");
            return false;
        }
        info!(
            "Tree closure holds {} nodes from {} lineages",
            closure.len(),
            retained.len()
        );
        if let Err(err) = write_to_file(&files.tree, &closure.join("\n")) {
            error!("failed writing tree file {}: {}", files.tree.display(), err);
            return false;
        }

        let rows = highlight_rows(
            retained.as_slice(),
            &self.forced_highlights,
            self.colors.as_ref(),
            self.relabels.as_ref(),
            &ctx,
        );
        if !rows.is_empty() {
            if let Err(err) = write_to_file(&files.highlight, &rows.join("\n")) {
                error!(
                    "failed writing highlight file {}: {}",
                    files.highlight.display(),
                    err
                );
                return false;
            }
            made.highlight = true;
        }

        if let Some(colors) = &self.colors {
            let mut keys: Vec<&String> = colors.keys().collect();
            keys.sort();
            let lines: Vec<String> = keys
                .iter()
                .map(|key| format!("{}\t{}", key, colors[key.as_str()]))
                .collect();
            if !lines.is_empty() {
                match write_to_file(&files.color, &lines.join("\n")) {
                    Ok(()) => made.color = true,
                    Err(err) => warn!("skipping color file {}: {}", files.color.display(), err),
                }
            }
        }

        if let Some(ticks) = &self.ticks {
            let lines: Vec<String> = ticks
                .iter()
                .map(|(level, name)| format!("{}\t{}", level, name))
                .collect();
            if !lines.is_empty() {
                match write_to_file(&files.tick, &lines.join("\n")) {
                    Ok(()) => made.tick = true,
                    Err(err) => warn!("skipping tick file {}: {}", files.tick.display(), err),
                }
            }
        }

        if let Some(table) = &self.abundance {
            let content = size_content(
                table,
                &retained,
                &ctx,
                self.min_log_size,
                self.log_scale,
                self.circle_scale,
            );
            if !content.is_empty() {
                if let Err(err) = write_to_file(&files.size, &content) {
                    error!("failed writing size file {}: {}", files.size.display(), err);
                    return false;
                }
                made.size = true;
            }
        }

        if skip_render {
            info!("Skipping renderer invocation");
            return true;
        }
        run_renderer(files, &made)
    }
}

/// Read a config file's content lines, skipping blanks and `#` comments.
fn read_config_lines(path: &Path) -> io::Result<Vec<String>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        lines.push(line.to_string());
    }
    Ok(lines)
}

/// Load color assignments: `key<TAB>R,G,B` or `key<TAB>#rrggbb` (hex is
/// normalized to the `R,G,B` form).
fn load_colors(path: &Path) -> io::Result<FxHashMap<String, String>> {
    let mut colors = FxHashMap::default();
    for line in read_config_lines(path)? {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 2 {
            continue;
        }
        let value = parts[1].trim();
        let rgb = if value.starts_with('#') && value.len() == 7 {
            let r = u8::from_str_radix(&value[1..3], 16).unwrap_or(0);
            let g = u8::from_str_radix(&value[3..5], 16).unwrap_or(0);
            let b = u8::from_str_radix(&value[5..7], 16).unwrap_or(0);
            format!("{},{},{}", r, g, b)
        } else {
            value.to_string()
        };
        colors.insert(parts[0].to_string(), rgb);
    }
    Ok(colors)
}

/// Load tick levels: `level<TAB>name`, file order preserved.
fn load_ticks(path: &Path) -> io::Result<Vec<(String, String)>> {
    let mut ticks = Vec::new();
    for line in read_config_lines(path)? {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 2 {
            continue;
        }
        ticks.push((parts[0].to_string(), parts[1].to_string()));
    }
    Ok(ticks)
}

/// Load forced highlights: `lineage<TAB>colorKey`.
fn load_highlights(path: &Path) -> io::Result<FxHashMap<String, String>> {
    let mut highlights = FxHashMap::default();
    for line in read_config_lines(path)? {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 2 {
            continue;
        }
        highlights.insert(parts[0].to_string(), parts[1].to_string());
    }
    Ok(highlights)
}

/// Load label replacements: `label<TAB>newLabel`.
fn load_relabels(path: &Path) -> io::Result<FxHashMap<String, String>> {
    let mut relabels = FxHashMap::default();
    for line in read_config_lines(path)? {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 2 {
            continue;
        }
        relabels.insert(parts[0].to_string(), parts[1].to_string());
    }
    Ok(relabels)
}

/// Parse a numeric band attribute: a single value or a comma-list matched to
/// the taxa positions.
fn parse_float_band(field: &str) -> io::Result<BandValue<f64>> {
    if field.contains(',') {
        let mut values = Vec::new();
        for token in field.split(',') {
            match token.trim().parse::<f64>() {
                Ok(value) => values.push(value),
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("non-numeric band value '{}'", token),
                    ));
                }
            }
        }
        Ok(BandValue::PerTaxon(values))
    } else {
        field
            .trim()
            .parse::<f64>()
            .map(BandValue::Uniform)
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("non-numeric band value '{}'", field),
                )
            })
    }
}

/// Parse a shape band attribute: a single shape or a comma-list.
fn parse_shape_band(field: &str) -> BandValue<String> {
    if field.contains(',') {
        BandValue::PerTaxon(field.split(',').map(|token| token.trim().to_string()).collect())
    } else {
        BandValue::Uniform(field.trim().to_string())
    }
}

/// Load circle bands:
/// `name<TAB>taxon,taxon,...[<TAB>alpha[<TAB>shape[<TAB>border[<TAB>forced]]]]`.
fn load_circles(path: &Path) -> io::Result<Vec<CircleBand>> {
    let mut bands = Vec::new();
    for line in read_config_lines(path)? {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 2 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("circle line needs a name and a taxa list: '{}'", line),
            ));
        }
        let taxa: Vec<String> = parts[1]
            .split(',')
            .map(str::trim)
            .filter(|taxon| !taxon.is_empty())
            .map(String::from)
            .collect();
        let alpha = parse_float_band(parts.get(2).copied().unwrap_or("1.0"))?;
        let shape = parse_shape_band(parts.get(3).copied().unwrap_or("R"));
        let border = parse_float_band(parts.get(4).copied().unwrap_or("0.0"))?;
        let forced = matches!(parts.get(5).copied().unwrap_or("0"), "1" | "true" | "True");
        bands.push(CircleBand {
            taxa,
            name: parts[0].to_string(),
            border,
            shape,
            alpha,
            forced,
        });
    }
    Ok(bands)
}

/// Resolve a channel file path: the explicit flag wins, otherwise derive
/// `<imageStem>_<suffix>.txt` next to the image.
fn channel_path(image: &Path, explicit: &Option<PathBuf>, suffix: &str) -> PathBuf {
    if let Some(path) = explicit {
        return path.clone();
    }
    let stem = image
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("cladogram");
    image.with_file_name(format!("{}_{}.txt", stem, suffix))
}

fn output_files(args: &Args) -> OutputFiles {
    OutputFiles {
        image: args.out.clone(),
        style: args.style.clone(),
        script: args.script.clone(),
        tree: channel_path(&args.out, &args.tree_file, "taxa"),
        color: channel_path(&args.out, &args.color_file, "color"),
        tick: channel_path(&args.out, &args.tick_file, "tick"),
        highlight: channel_path(&args.out, &args.highlight_file, "highlight"),
        size: channel_path(&args.out, &args.size_file, "size"),
        circle: channel_path(&args.out, &args.circle_file, "circle"),
    }
}

fn main() {
    let args = Args::parse();

    // Initialize logger based on verbosity
    env_logger::Builder::new()
        .filter_level(match args.verbose {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .init();

    if args.measure_level == 0 || args.reduce_level == 0 {
        eprintln!("Error: clade levels are 1-based and must be positive");
        std::process::exit(1);
    }
    if args.reduce_level > args.measure_level {
        eprintln!("Error: --reduce-level must not exceed --measure-level");
        std::process::exit(1);
    }

    info!("Loading abundance table...");
    let table = match AbundanceTable::from_tsv(&args.abundance) {
        Ok(table) => table,
        Err(err) => {
            eprintln!("Error loading abundance table: {}", err);
            std::process::exit(1);
        }
    };
    info!(
        "Found {} lineages across {} samples",
        table.rows.len(),
        table.sample_names.len()
    );

    let mut cladogram = Cladogram::new();
    cladogram.set_feature_delimiter(args.delimiter);
    cladogram.set_unclassified_label(args.unclassified.clone());
    cladogram.set_abundance(table);
    cladogram.set_circle_scale(args.circle_scale);
    cladogram.set_size_scaling(args.log_scale, args.min_log_size);

    if let Some(path) = &args.colors {
        match load_colors(path) {
            Ok(colors) => cladogram.set_colors(colors),
            Err(err) => {
                eprintln!("Error loading color file: {}", err);
                std::process::exit(1);
            }
        }
    }
    if let Some(path) = &args.ticks {
        match load_ticks(path) {
            Ok(ticks) => cladogram.set_ticks(ticks),
            Err(err) => {
                eprintln!("Error loading tick file: {}", err);
                std::process::exit(1);
            }
        }
    }
    if let Some(path) = &args.highlights {
        match load_highlights(path) {
            Ok(highlights) => cladogram.add_highlights(highlights, false),
            Err(err) => {
                eprintln!("Error loading highlight file: {}", err);
                std::process::exit(1);
            }
        }
    }
    debug!("{} forced highlights configured", cladogram.highlights().len());
    if let Some(path) = &args.relabels {
        match load_relabels(path) {
            Ok(relabels) => cladogram.relabel_ids(relabels),
            Err(err) => {
                eprintln!("Error loading relabel file: {}", err);
                std::process::exit(1);
            }
        }
    }
    if let Some(path) = &args.circles {
        match load_circles(path) {
            Ok(bands) => {
                for band in bands {
                    cladogram.add_circle(band);
                }
            }
            Err(err) => {
                eprintln!("Error loading circle file: {}", err);
                std::process::exit(1);
            }
        }
    }

    if args.filter_abundance {
        cladogram.set_abundance_filter(Some(AbundanceFilter {
            percentile_cutoff: args.percentile,
            percent_above: args.percent_above,
        }));
    }
    if args.filter_clade_size {
        cladogram.set_clade_size_filter(Some(CladeSizeFilter {
            measure_level: args.measure_level,
            reduce_level: args.reduce_level,
            min_clade_size: args.min_clade_size,
        }));
    }
    if let Some(root) = &args.root {
        cladogram.force_root(root.clone());
    }

    let files = output_files(&args);
    if !cladogram.generate(&files, args.terminal_level, args.skip_render) {
        eprintln!("Error: cladogram generation failed");
        std::process::exit(1);
    }
    debug!("{} display labels computed", cladogram.labels().len());

    info!("Done.");
}
