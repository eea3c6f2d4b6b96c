//! Signal filters.
//!
//! - [`design`]: Hamming-windowed sinc FIR design (highpass, bandpass, notch)
//!   with MNE-style automatic transition bandwidths.
//! - [`apply`]: overlap-add zero-phase FIR convolution.
//! - [`iir`]: Butterworth band-pass as second-order sections, zero-phase
//!   forward-backward application (used for band power).

pub mod apply;
pub mod design;
pub mod iir;

pub use apply::{apply_fir_zero_phase, filter_1d, OverlapAdd};
pub use design::{
    auto_filter_length, auto_h_trans_bandwidth, auto_trans_bandwidth, design_bandpass,
    design_highpass, design_notch, firwin, hamming,
};
pub use iir::{butter_bandpass, sosfilt, sosfilt_zi, sosfiltfilt, Sos};
