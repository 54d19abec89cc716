//! Deterministic stand-in for the test controller.
//!
//! Used when no hardware is attached: the whole result set for a request is
//! synthesized in one shot and written through the same results sink contract.
use crate::results::{ResultsSink, SinkError, SIMULATED_COLUMNS};
use super::models::TestRequest;

/// Codeword length of the simulated LDPC decoder
pub const FRAME_BITS: i32 = 648;

#[derive(Debug, Clone, Copy, Default)]
pub struct Simulator;

impl Simulator {
    pub fn new() -> Self {
        Self
    }

    /// One `[SNR, BER, FER]` record per sweep point
    pub fn rows(&self, request: &TestRequest) -> Vec<[String; 3]> {
        request
            .sweep
            .points()
            .into_iter()
            .map(|snr| {
                let ber = bit_error_rate(snr);
                let fer = 1.0 - (1.0 - ber).powi(FRAME_BITS);
                [format_snr(snr), format!("{:.6e}", ber), format!("{:.6e}", fer)]
            })
            .collect()
    }

    /// Write header and every row, returning the number of rows written
    pub fn write_results(&self, request: &TestRequest, sink: &mut ResultsSink) -> Result<u64, SinkError> {
        sink.write_header(SIMULATED_COLUMNS)?;
        for row in self.rows(request) {
            sink.append_row(&row)?;
        }
        log::info!(
            "Simulated {} point(s) for test {} on {}",
            sink.rows_written(),
            request.id,
            request.chip_id
        );
        Ok(sink.rows_written())
    }
}

/// Uncoded BPSK over AWGN: 0.5 * erfc(sqrt(Eb/N0))
fn bit_error_rate(snr_db: f64) -> f64 {
    let ebn0 = 10f64.powf(snr_db / 10.0);
    0.5 * erfc(ebn0.sqrt())
}

// Abramowitz & Stegun 7.1.26, |error| < 1.5e-7; x >= 0 here
fn erfc(x: f64) -> f64 {
    const P: f64 = 0.327_591_1;
    const A: [f64; 5] = [0.254_829_592, -0.284_496_736, 1.421_413_741, -1.453_152_027, 1.061_405_429];

    if x < 0.0 {
        return 2.0 - erfc(-x);
    }
    let t = 1.0 / (1.0 + P * x);
    let poly = A.iter().rev().fold(0.0, |acc, a| acc * t + a) * t;
    poly * (-x * x).exp()
}

fn format_snr(snr: f64) -> String {
    let text = format!("{:.6}", snr);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text == "-0" {
        "0".to_string()
    } else {
        text.to_string()
    }
}
