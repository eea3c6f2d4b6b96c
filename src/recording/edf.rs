//! EDF / EDF+ reader.
//!
//! Layout (all header fields are space-padded ASCII):
//!
//! ```text
//! ┌──────────────────────── fixed header, 256 bytes ────────────────────────┐
//! │ version 8 │ patient 80 │ recording 80 │ date 8 │ time 8 │ header len 8  │
//! │ reserved 44 │ n_records 8 │ record duration 8 │ n_signals 4             │
//! ├──────────────────── per-signal header, ns × 256 bytes ──────────────────┤
//! │ label 16 │ transducer 80 │ phys dim 8 │ phys min 8 │ phys max 8         │
//! │ dig min 8 │ dig max 8 │ prefilter 80 │ samples/record 8 │ reserved 32   │
//! ├──────────────────────────── data records ──────────────────────────────┤
//! │ per record, per signal: samples/record × i16 LE                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Physical values: `(digital - dig_min) · (phys_max - phys_min) / (dig_max - dig_min) + phys_min`,
//! then scaled to volts from the physical dimension (`uV`, `mV`, …).
//!
//! Only signals sampled at the highest rate in the file are returned; slower
//! auxiliary channels (hypnogram markers, temperature, …) and the
//! `EDF Annotations` signal are dropped.
use anyhow::{bail, Context, Result};
use ndarray::Array2;
use std::path::Path;
use tracing::debug;

use super::RawRecording;
use crate::error::EdfError;

const FIXED_HEADER: usize = 256;
const SIGNAL_HEADER: usize = 256;
const ANNOTATIONS_LABEL: &str = "EDF Annotations";

/// One signal's header entry.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalHeader {
    pub label:        String,
    pub transducer:   String,
    pub physical_dim: String,
    pub physical_min: f64,
    pub physical_max: f64,
    pub digital_min:  f64,
    pub digital_max:  f64,
    pub prefilter:    String,
    pub samples_per_record: usize,
}

impl SignalHeader {
    /// `true` for the EDF+ annotation channel.
    pub fn is_annotation(&self) -> bool {
        self.label == ANNOTATIONS_LABEL
    }

    /// Multiplier from physical units to volts.
    pub fn unit_scale(&self) -> f64 {
        match self.physical_dim.as_str() {
            "uV" | "µV" | "microV" => 1e-6,
            "mV" => 1e-3,
            "nV" => 1e-9,
            _ => 1.0,
        }
    }

    /// `(gain, offset)` such that `physical = digital · gain + offset`.
    pub fn calibration(&self) -> (f64, f64) {
        let span = self.digital_max - self.digital_min;
        let gain = if span != 0.0 {
            (self.physical_max - self.physical_min) / span
        } else {
            1.0
        };
        (gain, self.physical_min - self.digital_min * gain)
    }
}

/// Parsed file header.
#[derive(Debug, Clone, PartialEq)]
pub struct EdfHeader {
    pub version:      String,
    pub patient:      String,
    pub recording:    String,
    pub header_bytes: usize,
    /// `-1` in the file means "unknown"; resolved from the file size.
    pub n_records:    usize,
    pub record_duration: f64,
    pub signals:      Vec<SignalHeader>,
}

impl EdfHeader {
    /// Total i16 samples in one data record across all signals.
    pub fn samples_per_record(&self) -> usize {
        self.signals.iter().map(|s| s.samples_per_record).sum()
    }

    /// Sampling rate of signal `idx` in Hz.
    pub fn sfreq(&self, idx: usize) -> f64 {
        self.signals[idx].samples_per_record as f64 / self.record_duration
    }
}

/// Read an EDF file into a [`RawRecording`].
pub fn read_edf(path: &Path) -> Result<RawRecording> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_edf(&bytes).with_context(|| format!("decoding EDF {}", path.display()))
}

/// Decode an in-memory EDF file.
pub fn parse_edf(bytes: &[u8]) -> Result<RawRecording> {
    let header = parse_header(bytes)?;

    let data_idx: Vec<usize> = (0..header.signals.len())
        .filter(|&i| !header.signals[i].is_annotation() && header.signals[i].samples_per_record > 0)
        .collect();
    let max_spr = data_idx
        .iter()
        .map(|&i| header.signals[i].samples_per_record)
        .max()
        .ok_or(EdfError::NoSignals)?;
    let keep: Vec<usize> = data_idx
        .iter()
        .copied()
        .filter(|&i| header.signals[i].samples_per_record == max_spr)
        .collect();
    for &i in &data_idx {
        if header.signals[i].samples_per_record != max_spr {
            debug!(
                channel = %header.signals[i].label,
                sfreq = header.sfreq(i),
                "dropping channel sampled below the recording rate"
            );
        }
    }

    // Byte offset of each signal inside a record.
    let mut offsets = Vec::with_capacity(header.signals.len());
    let mut acc = 0usize;
    for s in &header.signals {
        offsets.push(acc);
        acc += s.samples_per_record * 2;
    }
    let record_bytes = acc;

    let n_t = header.n_records * max_spr;
    let mut data = Array2::<f32>::zeros((keep.len(), n_t));
    for rec in 0..header.n_records {
        let rec_start = header.header_bytes + rec * record_bytes;
        for (row, &sig) in keep.iter().enumerate() {
            let s = &header.signals[sig];
            let (gain, offset) = s.calibration();
            let scale = s.unit_scale();
            let base = rec_start + offsets[sig];
            let chunk = &bytes[base..base + max_spr * 2];
            let t0 = rec * max_spr;
            for (k, b) in chunk.chunks_exact(2).enumerate() {
                let dig = i16::from_le_bytes([b[0], b[1]]) as f64;
                data[[row, t0 + k]] = ((dig * gain + offset) * scale) as f32;
            }
        }
    }

    let sfreq = (max_spr as f64 / header.record_duration) as f32;
    let ch_names = keep.iter().map(|&i| header.signals[i].label.clone()).collect();
    RawRecording::new(data, sfreq, ch_names)
}

/// Parse the fixed and per-signal headers, resolving `n_records = -1`.
pub fn parse_header(bytes: &[u8]) -> Result<EdfHeader> {
    if bytes.len() < FIXED_HEADER {
        return Err(EdfError::Truncated { len: bytes.len() }.into());
    }
    let version   = ascii(&bytes[0..8]);
    let patient   = ascii(&bytes[8..88]);
    let recording = ascii(&bytes[88..168]);
    let header_bytes: usize = number(&bytes[184..192], "header bytes")?;
    let n_records: i64 = number(&bytes[236..244], "number of records")?;
    let record_duration: f64 = number(&bytes[244..252], "record duration")?;
    let ns: usize = number(&bytes[252..256], "number of signals")?;

    if bytes.len() < FIXED_HEADER + ns * SIGNAL_HEADER {
        return Err(EdfError::Truncated { len: bytes.len() }.into());
    }
    if header_bytes != FIXED_HEADER + ns * SIGNAL_HEADER {
        bail!("header length {header_bytes} inconsistent with {ns} signals");
    }
    if record_duration <= 0.0 {
        bail!("record duration must be positive, got {record_duration}");
    }

    // Per-signal fields are stored column-wise: all labels, then all transducers, …
    let mut cursor = FIXED_HEADER;
    let mut field = |width: usize| columns(bytes, &mut cursor, ns, width);
    let labels     = field(16);
    let transducer = field(80);
    let phys_dim   = field(8);
    let phys_min   = field(8);
    let phys_max   = field(8);
    let dig_min    = field(8);
    let dig_max    = field(8);
    let prefilter  = field(80);
    let n_samples  = field(8);

    let mut signals = Vec::with_capacity(ns);
    for i in 0..ns {
        signals.push(SignalHeader {
            label:        ascii(labels[i]),
            transducer:   ascii(transducer[i]),
            physical_dim: ascii(phys_dim[i]),
            physical_min: number(phys_min[i], "physical minimum")?,
            physical_max: number(phys_max[i], "physical maximum")?,
            digital_min:  number(dig_min[i], "digital minimum")?,
            digital_max:  number(dig_max[i], "digital maximum")?,
            prefilter:    ascii(prefilter[i]),
            samples_per_record: number(n_samples[i], "samples per record")?,
        });
    }

    let record_bytes: usize = signals.iter().map(|s| s.samples_per_record * 2).sum();
    let available = (bytes.len() - header_bytes) / record_bytes.max(1);
    let n_records = if n_records < 0 {
        available
    } else {
        let declared = n_records as usize;
        if declared > available {
            bail!("header declares {declared} records but file holds {available}");
        }
        declared
    };

    Ok(EdfHeader { version, patient, recording, header_bytes, n_records, record_duration, signals })
}

fn columns<'a>(bytes: &'a [u8], cursor: &mut usize, ns: usize, width: usize) -> Vec<&'a [u8]> {
    let start = *cursor;
    *cursor += ns * width;
    (0..ns)
        .map(|i| &bytes[start + i * width..start + (i + 1) * width])
        .collect()
}

fn ascii(raw: &[u8]) -> String {
    raw.iter().map(|&b| b as char).collect::<String>().trim().to_string()
}

fn number<T: std::str::FromStr>(raw: &[u8], field: &'static str) -> Result<T> {
    let text = ascii(raw);
    text.parse::<T>()
        .map_err(|_| EdfError::BadField { field, value: text }.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pad(s: &str, w: usize) -> Vec<u8> {
        let mut v = s.as_bytes().to_vec();
        v.resize(w, b' ');
        v
    }

    /// Two signals: "EEG Fpz-Cz" at 4 samples/record, "Temp" at 1 sample/record.
    fn tiny_edf() -> Vec<u8> {
        let ns = 2;
        let mut b = Vec::new();
        b.extend(pad("0", 8));
        b.extend(pad("X", 80));
        b.extend(pad("Y", 80));
        b.extend(pad("01.01.20", 8));
        b.extend(pad("00.00.00", 8));
        b.extend(pad(&(256 + ns * 256).to_string(), 8));
        b.extend(pad("", 44));
        b.extend(pad("2", 8));
        b.extend(pad("1", 8));
        b.extend(pad(&ns.to_string(), 4));
        for l in ["EEG Fpz-Cz", "Temp"] { b.extend(pad(l, 16)); }
        for _ in 0..ns { b.extend(pad("", 80)); }
        for d in ["uV", "degC"] { b.extend(pad(d, 8)); }
        for _ in 0..ns { b.extend(pad("-100", 8)); }
        for _ in 0..ns { b.extend(pad("100", 8)); }
        for _ in 0..ns { b.extend(pad("-100", 8)); }
        for _ in 0..ns { b.extend(pad("100", 8)); }
        for _ in 0..ns { b.extend(pad("", 80)); }
        for n in ["4", "1"] { b.extend(pad(n, 8)); }
        for _ in 0..ns { b.extend(pad("", 32)); }
        for rec in 0..2i16 {
            for k in 0..4i16 { b.extend((rec * 4 + k).to_le_bytes()); }
            b.extend(37i16.to_le_bytes());
        }
        b
    }

    #[test]
    fn header_fields_parse() {
        let h = parse_header(&tiny_edf()).unwrap();
        assert_eq!(h.n_records, 2);
        assert_eq!(h.signals.len(), 2);
        assert_eq!(h.signals[0].label, "EEG Fpz-Cz");
        assert_eq!(h.samples_per_record(), 5);
        approx::assert_abs_diff_eq!(h.sfreq(0), 4.0);
    }

    #[test]
    fn slow_channels_dropped_and_scaled_to_volts() {
        let rec = parse_edf(&tiny_edf()).unwrap();
        assert_eq!(rec.ch_names, vec!["EEG Fpz-Cz".to_string()]);
        assert_eq!(rec.data.dim(), (1, 8));
        approx::assert_abs_diff_eq!(rec.sfreq, 4.0);
        // identity calibration, µV → V
        for t in 0..8 {
            approx::assert_abs_diff_eq!(rec.data[[0, t]], t as f32 * 1e-6, epsilon = 1e-12);
        }
    }

    #[test]
    fn truncated_file_is_typed_error() {
        let err = parse_edf(&[0u8; 10]).unwrap_err();
        assert_eq!(err.downcast_ref::<EdfError>(), Some(&EdfError::Truncated { len: 10 }));
    }

    #[test]
    fn non_numeric_field_rejected() {
        let mut bytes = tiny_edf();
        bytes[236..244].copy_from_slice(b"abc     ");
        let err = parse_header(&bytes).unwrap_err();
        assert!(matches!(err.downcast_ref::<EdfError>(), Some(EdfError::BadField { .. })));
    }
}
