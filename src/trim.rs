//! Silence trimming with protected windows.
//!
//! Protected slabs are kept verbatim and never analyzed; every other slab is
//! run through `silencedetect` and only its speech (plus guard padding)
//! survives. Any failure degrades to copying the input through unchanged.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::config::TrimConfig;
use crate::probe::probe_media;
use crate::timeline::{MessageSpan, ProtectedRange};
use crate::toolchain::{seconds_arg, Tool, Toolchain};

const MIN_SLAB_SECONDS: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimeRange {
    pub start_seconds: f64,
    pub end_seconds: f64,
}

impl TimeRange {
    pub fn new(start_seconds: f64, end_seconds: f64) -> Self {
        Self {
            start_seconds,
            end_seconds,
        }
    }

    pub fn len(&self) -> f64 {
        (self.end_seconds - self.start_seconds).max(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 0.0
    }

    fn offset(self, by: f64) -> Self {
        Self::new(self.start_seconds + by, self.end_seconds + by)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Slab {
    Protected(TimeRange),
    Unprotected(TimeRange),
}

/// Sorts and merges overlapping or touching ranges.
pub fn coalesce_ranges(mut ranges: Vec<TimeRange>) -> Vec<TimeRange> {
    ranges.retain(|range| range.end_seconds > range.start_seconds);
    ranges.sort_by(|a, b| a.start_seconds.total_cmp(&b.start_seconds));
    let mut merged: Vec<TimeRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start_seconds <= last.end_seconds => {
                last.end_seconds = last.end_seconds.max(range.end_seconds);
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// Splits `[0, total)` into alternating protected and unprotected slabs.
pub fn unprotected_slabs(total_seconds: f64, protected: &[ProtectedRange]) -> Vec<Slab> {
    let clamped = protected
        .iter()
        .map(|range| {
            TimeRange::new(
                range.start_seconds.clamp(0.0, total_seconds),
                range.end_seconds.clamp(0.0, total_seconds),
            )
        })
        .collect();
    let protected = coalesce_ranges(clamped);

    let mut slabs = Vec::with_capacity(protected.len() * 2 + 1);
    let mut cursor = 0.0_f64;
    for range in protected {
        if range.start_seconds - cursor >= MIN_SLAB_SECONDS {
            slabs.push(Slab::Unprotected(TimeRange::new(cursor, range.start_seconds)));
        }
        slabs.push(Slab::Protected(range));
        cursor = range.end_seconds;
    }
    if total_seconds - cursor >= MIN_SLAB_SECONDS {
        slabs.push(Slab::Unprotected(TimeRange::new(cursor, total_seconds)));
    }
    slabs
}

/// Reads silence windows from `silencedetect` log output. An unterminated
/// window runs to `total_seconds`.
pub fn parse_silencedetect(stderr: &str, total_seconds: f64) -> Vec<TimeRange> {
    let mut silences = Vec::new();
    let mut open: Option<f64> = None;
    for line in stderr.lines() {
        if let Some(start) = value_after(line, "silence_start:") {
            open = Some(start.max(0.0));
        } else if let Some(end) = value_after(line, "silence_end:") {
            let start = open.take().unwrap_or(0.0);
            silences.push(TimeRange::new(start, end.min(total_seconds)));
        }
    }
    if let Some(start) = open {
        silences.push(TimeRange::new(start, total_seconds));
    }
    silences
}

fn value_after(line: &str, marker: &str) -> Option<f64> {
    let rest = &line[line.find(marker)? + marker.len()..];
    rest.split_whitespace()
        .next()?
        .trim_end_matches('|')
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

/// Complement of the silences within `[0, total)`, padded and coalesced.
pub fn speech_spans(silences: &[TimeRange], total_seconds: f64, padding: f64) -> Vec<TimeRange> {
    let silences = coalesce_ranges(silences.to_vec());
    let mut spans = Vec::with_capacity(silences.len() + 1);
    let mut cursor = 0.0_f64;
    for silence in &silences {
        if silence.start_seconds > cursor {
            spans.push(TimeRange::new(cursor, silence.start_seconds));
        }
        cursor = cursor.max(silence.end_seconds);
    }
    if total_seconds > cursor {
        spans.push(TimeRange::new(cursor, total_seconds));
    }
    coalesce_ranges(
        spans
            .into_iter()
            .map(|span| {
                TimeRange::new(
                    (span.start_seconds - padding).max(0.0),
                    (span.end_seconds + padding).min(total_seconds),
                )
            })
            .collect(),
    )
}

/// Keep ranges for the whole clip. `detect` returns silences relative to the
/// start of the slab it is given.
pub fn plan_keep_ranges<F>(
    total_seconds: f64,
    protected: &[ProtectedRange],
    padding: f64,
    mut detect: F,
) -> Result<Vec<TimeRange>>
where
    F: FnMut(TimeRange) -> Result<Vec<TimeRange>>,
{
    let mut keep = Vec::new();
    for slab in unprotected_slabs(total_seconds, protected) {
        match slab {
            Slab::Protected(range) => keep.push(range),
            Slab::Unprotected(range) => {
                let silences = detect(range)?;
                keep.extend(
                    speech_spans(&silences, range.len(), padding)
                        .into_iter()
                        .map(|span| span.offset(range.start_seconds)),
                );
            }
        }
    }
    Ok(coalesce_ranges(keep))
}

/// `select`/`aselect` predicate keeping exactly the given ranges.
pub fn select_expression(ranges: &[TimeRange]) -> String {
    ranges
        .iter()
        .map(|range| {
            format!(
                "between(t,{},{})",
                seconds_arg(range.start_seconds),
                seconds_arg(range.end_seconds)
            )
        })
        .collect::<Vec<_>>()
        .join("+")
}

/// Maps source timestamps onto the trimmed output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeepRanges {
    ranges: Vec<TimeRange>,
    identity: bool,
}

impl KeepRanges {
    pub fn new(ranges: Vec<TimeRange>) -> Self {
        Self {
            ranges: coalesce_ranges(ranges),
            identity: false,
        }
    }

    /// Untrimmed output: every timestamp maps to itself.
    pub fn identity(total_seconds: f64) -> Self {
        Self {
            ranges: coalesce_ranges(vec![TimeRange::new(0.0, total_seconds)]),
            identity: true,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.identity
    }

    pub fn ranges(&self) -> &[TimeRange] {
        &self.ranges
    }

    pub fn kept_seconds(&self) -> f64 {
        self.ranges.iter().map(TimeRange::len).sum()
    }

    /// A time inside a cut maps to the point where the next kept range starts.
    pub fn remap(&self, t: f64) -> f64 {
        if self.identity {
            return t.max(0.0);
        }
        let mut out = 0.0_f64;
        for range in &self.ranges {
            if t <= range.start_seconds {
                break;
            }
            if t < range.end_seconds {
                return out + (t - range.start_seconds);
            }
            out += range.len();
        }
        out
    }

    pub fn remap_spans(&self, spans: &[MessageSpan]) -> Vec<MessageSpan> {
        spans
            .iter()
            .map(|span| MessageSpan {
                text: span.text.clone(),
                start_seconds: self.remap(span.start_seconds),
                end_seconds: self.remap(span.end_seconds),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrimOutcome {
    Trimmed,
    CopiedThrough { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrimReport {
    pub output: PathBuf,
    pub keep_ranges: KeepRanges,
    pub kept_seconds: f64,
    pub input_seconds: f64,
    pub outcome: TrimOutcome,
}

fn detect_silence(
    toolchain: &Toolchain,
    input: &Path,
    slab: TimeRange,
    settings: &TrimConfig,
) -> Result<Vec<TimeRange>> {
    let args = vec![
        "-hide_banner".to_owned(),
        "-nostats".to_owned(),
        "-ss".to_owned(),
        seconds_arg(slab.start_seconds),
        "-t".to_owned(),
        seconds_arg(slab.len()),
        "-i".to_owned(),
        input.to_string_lossy().into_owned(),
        "-vn".to_owned(),
        "-af".to_owned(),
        format!(
            "silencedetect=noise={}dB:d={}",
            settings.noise_db,
            seconds_arg(settings.min_silence_seconds)
        ),
        "-f".to_owned(),
        "null".to_owned(),
        "-".to_owned(),
    ];
    let output = toolchain
        .run(Tool::Ffmpeg, args)
        .with_context(|| format!("silencedetect failed on {}", input.display()))?;
    Ok(parse_silencedetect(&output.stderr, slab.len()))
}

fn encode_selection(
    toolchain: &Toolchain,
    input: &Path,
    output: &Path,
    keep: &KeepRanges,
    fps: Option<f64>,
) -> Result<()> {
    let expression = select_expression(keep.ranges());
    let mut args = vec![
        "-hide_banner".to_owned(),
        "-loglevel".to_owned(),
        "error".to_owned(),
        "-y".to_owned(),
        "-i".to_owned(),
        input.to_string_lossy().into_owned(),
        "-vf".to_owned(),
        format!("select='{expression}',setpts=N/FRAME_RATE/TB"),
        "-af".to_owned(),
        format!("aselect='{expression}',asetpts=N/SR/TB"),
        "-c:v".to_owned(),
        "libx264".to_owned(),
        "-pix_fmt".to_owned(),
        "yuv420p".to_owned(),
    ];
    if let Some(fps) = fps {
        args.extend(["-r".to_owned(), format!("{fps:.3}")]);
    }
    args.extend(
        ["-c:a", "aac", "-b:a", "192k", "-movflags", "+faststart"]
            .into_iter()
            .map(str::to_owned),
    );
    args.push(output.to_string_lossy().into_owned());
    toolchain
        .run(Tool::Ffmpeg, args)
        .context("trim encode failed")?;
    Ok(())
}

fn copy_through(input: &Path, output: &Path, reason: String, input_seconds: f64) -> Result<TrimReport> {
    tracing::warn!(stage = "trim", %reason, "copying input through untrimmed");
    fs::copy(input, output).with_context(|| {
        format!(
            "failed to copy {} to {}",
            input.display(),
            output.display()
        )
    })?;
    let keep = KeepRanges::identity(input_seconds);
    Ok(TrimReport {
        output: output.to_path_buf(),
        kept_seconds: keep.kept_seconds(),
        keep_ranges: keep,
        input_seconds,
        outcome: TrimOutcome::CopiedThrough { reason },
    })
}

/// Trims silence from `input` into `output`. Only a failed copy-through is an error.
///
/// `expected_seconds` stands in for the input duration when it cannot be probed.
pub fn trim_silence(
    toolchain: &Toolchain,
    input: &Path,
    output: &Path,
    protected: &[ProtectedRange],
    settings: &TrimConfig,
    expected_seconds: f64,
) -> Result<TrimReport> {
    if input == output {
        bail!("trim input and output must differ");
    }
    let info = match probe_media(toolchain, input) {
        Ok(info) => info,
        Err(error) => {
            return copy_through(
                input,
                output,
                format!("probe failed: {error:#}"),
                expected_seconds,
            )
        }
    };
    let total = info.duration_seconds;
    if !settings.enabled {
        return copy_through(input, output, "trimming disabled".to_owned(), total);
    }

    let planned = plan_keep_ranges(total, protected, settings.padding_seconds, |slab| {
        detect_silence(toolchain, input, slab, settings)
    });
    let keep = match planned {
        Ok(ranges) if !ranges.is_empty() => KeepRanges::new(ranges),
        Ok(_) => return copy_through(input, output, "no keep ranges".to_owned(), total),
        Err(error) => {
            return copy_through(input, output, format!("silence detection failed: {error:#}"), total)
        }
    };
    if total - keep.kept_seconds() < 1.0 / info.fps.unwrap_or(30.0) {
        return copy_through(input, output, "nothing to trim".to_owned(), total);
    }

    if let Err(error) = encode_selection(toolchain, input, output, &keep, info.fps) {
        let _ = fs::remove_file(output);
        return copy_through(input, output, format!("{error:#}"), total);
    }
    tracing::info!(
        stage = "trim",
        input_seconds = total,
        kept_seconds = keep.kept_seconds(),
        ranges = keep.ranges().len(),
        "silence trimmed"
    );
    Ok(TrimReport {
        output: output.to_path_buf(),
        kept_seconds: keep.kept_seconds(),
        keep_ranges: keep,
        input_seconds: total,
        outcome: TrimOutcome::Trimmed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(start: f64, end: f64) -> TimeRange {
        TimeRange::new(start, end)
    }

    fn p(start: f64, end: f64) -> ProtectedRange {
        ProtectedRange {
            start_seconds: start,
            end_seconds: end,
        }
    }

    #[test]
    fn overlapping_ranges_merge() {
        assert_eq!(coalesce_ranges(vec![r(1.9, 3.0), r(1.0, 2.0)]), vec![r(1.0, 3.0)]);
        assert_eq!(
            coalesce_ranges(vec![r(1.0, 2.0), r(2.5, 3.0)]),
            vec![r(1.0, 2.0), r(2.5, 3.0)]
        );
        assert_eq!(coalesce_ranges(vec![r(0.0, 1.0), r(1.0, 2.0)]), vec![r(0.0, 2.0)]);
    }

    #[test]
    fn slabs_alternate_around_protected_ranges() {
        let slabs = unprotected_slabs(10.0, &[p(2.0, 4.0), p(6.0, 7.0)]);
        assert_eq!(
            slabs,
            vec![
                Slab::Unprotected(r(0.0, 2.0)),
                Slab::Protected(r(2.0, 4.0)),
                Slab::Unprotected(r(4.0, 6.0)),
                Slab::Protected(r(6.0, 7.0)),
                Slab::Unprotected(r(7.0, 10.0)),
            ]
        );
        assert_eq!(unprotected_slabs(5.0, &[]), vec![Slab::Unprotected(r(0.0, 5.0))]);
    }

    #[test]
    fn parses_silencedetect_log() {
        let log = "\
[silencedetect @ 0x1] silence_start: 0
[silencedetect @ 0x1] silence_end: 0.512 | silence_duration: 0.512
size=N/A time=00:00:03.00
[silencedetect @ 0x1] silence_start: 2.25
";
        assert_eq!(parse_silencedetect(log, 3.0), vec![r(0.0, 0.512), r(2.25, 3.0)]);
    }

    #[test]
    fn speech_is_the_padded_complement() {
        let spans = speech_spans(&[r(0.0, 1.0), r(2.0, 3.0)], 4.0, 0.25);
        assert_eq!(spans, vec![r(0.75, 2.25), r(2.75, 4.0)]);
        assert_eq!(speech_spans(&[], 2.0, 0.1), vec![r(0.0, 2.0)]);
        assert!(speech_spans(&[r(0.0, 2.0)], 2.0, 0.1).is_empty());
    }

    #[test]
    fn protected_ranges_survive_even_when_silent() {
        // Everything is silent; only the break may survive.
        let keep = plan_keep_ranges(10.0, &[p(3.0, 5.0)], 0.12, |slab| Ok(vec![r(0.0, slab.len())]))
            .unwrap();
        assert_eq!(keep, vec![r(3.0, 5.0)]);
    }

    #[test]
    fn slab_detections_are_offset_into_global_time() {
        let keep = plan_keep_ranges(10.0, &[p(4.0, 6.0)], 0.0, |slab| {
            // Silence in the first second of every slab.
            Ok(vec![r(0.0, 1.0_f64.min(slab.len()))])
        })
        .unwrap();
        assert_eq!(keep, vec![r(1.0, 6.0), r(7.0, 10.0)]);
    }

    #[test]
    fn select_expression_joins_ranges() {
        assert_eq!(
            select_expression(&[r(0.0, 1.5), r(2.0, 3.0)]),
            "between(t,0.000000,1.500000)+between(t,2.000000,3.000000)"
        );
    }

    #[test]
    fn remap_collapses_cut_time() {
        let keep = KeepRanges::new(vec![r(1.0, 2.0), r(3.0, 5.0)]);
        assert_eq!(keep.kept_seconds(), 3.0);
        assert_eq!(keep.remap(0.5), 0.0);
        assert_eq!(keep.remap(1.5), 0.5);
        assert_eq!(keep.remap(2.5), 1.0);
        assert_eq!(keep.remap(4.0), 2.0);
        assert_eq!(keep.remap(9.0), 3.0);
    }

    #[test]
    fn identity_keeps_every_timestamp() {
        let keep = KeepRanges::identity(4.5);
        assert!(keep.is_identity());
        assert_eq!(keep.kept_seconds(), 4.5);
        assert_eq!(keep.remap(0.0), 0.0);
        assert_eq!(keep.remap(2.25), 2.25);
        assert_eq!(keep.remap(4.5), 4.5);
    }
}
