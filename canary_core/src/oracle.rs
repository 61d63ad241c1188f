use crate::transport::{Transport, TransportError};
use std::time::Duration;
use tracing::trace;

/// The crash oracle both searches consult.
///
/// Wraps a transport with a fixed per-probe timeout and counts every payload sent.
/// The transport's survived/crashed answer is the only signal the searches use.
pub struct CrashOracle<'t> {
    transport: &'t mut dyn Transport,
    timeout: Duration,
    probes: u64,
}

impl<'t> CrashOracle<'t> {
    pub fn new(transport: &'t mut dyn Transport, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            probes: 0,
        }
    }

    /// Sends `payload` once and reports whether the target survived it.
    pub fn survives(&mut self, payload: &[u8]) -> Result<bool, TransportError> {
        self.probes += 1;
        let alive = self.transport.send(payload, self.timeout)?;
        trace!(
            "probe #{} via {}: {} bytes -> {}",
            self.probes,
            self.transport.name(),
            payload.len(),
            if alive { "survived" } else { "crashed" }
        );
        Ok(alive)
    }

    /// Survival on the first attempt and on `extra` identical repeats.
    ///
    /// Stops at the first crash, so a rejected payload costs as few probes as possible.
    pub fn confirmed(&mut self, payload: &[u8], extra: usize) -> Result<bool, TransportError> {
        for _ in 0..=extra {
            if !self.survives(payload)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Payloads sent so far.
    pub fn probes(&self) -> u64 {
        self.probes
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Transport whose answers come from a closure over the payload.
    pub(crate) struct FnTransport<F: FnMut(&[u8]) -> bool> {
        pub(crate) answer: F,
        pub(crate) sends: Vec<Vec<u8>>,
    }

    impl<F: FnMut(&[u8]) -> bool> FnTransport<F> {
        pub(crate) fn new(answer: F) -> Self {
            Self {
                answer,
                sends: Vec::new(),
            }
        }
    }

    impl<F: FnMut(&[u8]) -> bool> Transport for FnTransport<F> {
        fn name(&self) -> &'static str {
            "fn"
        }

        fn send(&mut self, payload: &[u8], _timeout: Duration) -> Result<bool, TransportError> {
            self.sends.push(payload.to_vec());
            Ok((self.answer)(payload))
        }

        fn close(&mut self) {}
    }

    #[test]
    fn survives_counts_probes() {
        let mut transport = FnTransport::new(|p| p.len() < 4);
        let mut oracle = CrashOracle::new(&mut transport, Duration::from_millis(1));
        assert!(oracle.survives(b"abc").unwrap());
        assert!(!oracle.survives(b"abcd").unwrap());
        assert_eq!(oracle.probes(), 2);
    }

    #[test]
    fn confirmed_repeats_identical_payload() {
        let mut transport = FnTransport::new(|_| true);
        let mut oracle = CrashOracle::new(&mut transport, Duration::from_millis(1));
        assert!(oracle.confirmed(b"xy", 3).unwrap());
        assert_eq!(oracle.probes(), 4);
        assert_eq!(transport.sends, vec![b"xy".to_vec(); 4]);
    }

    #[test]
    fn confirmed_stops_at_first_crash() {
        let mut calls = 0;
        let mut transport = FnTransport::new(move |_| {
            calls += 1;
            calls != 2
        });
        let mut oracle = CrashOracle::new(&mut transport, Duration::from_millis(1));
        assert!(!oracle.confirmed(b"z", 3).unwrap());
        assert_eq!(oracle.probes(), 2);
    }

    #[test]
    fn transport_errors_propagate() {
        struct Broken;
        impl Transport for Broken {
            fn name(&self) -> &'static str {
                "broken"
            }
            fn send(&mut self, _: &[u8], _: Duration) -> Result<bool, TransportError> {
                Err(TransportError::Disconnected {
                    target: "nowhere".into(),
                })
            }
            fn close(&mut self) {}
        }

        let mut transport = Broken;
        let mut oracle = CrashOracle::new(&mut transport, Duration::from_millis(1));
        assert!(matches!(
            oracle.survives(b"a"),
            Err(TransportError::Disconnected { .. })
        ));
    }
}
