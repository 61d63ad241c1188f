use crate::oracle::CrashOracle;
use crate::payload::PayloadBuilder;
use crate::transport::{Transport, TransportError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Binary search iteration cap. Enough for any bracket below 2^32.
pub const MAX_BISECT_ITERATIONS: usize = 32;

#[derive(Error, Debug)]
pub enum DiscoverError {
    /// Every probed length up to the ceiling survived.
    #[error("No crash observed up to max probe length {max_probe}")]
    NoCrash { max_probe: usize },

    /// The bracket did not narrow to adjacent lengths within the iteration cap.
    #[error(
        "Binary search did not converge after {iterations} iterations (bracket {last_safe}..{first_crash})"
    )]
    NotConverged {
        iterations: usize,
        last_safe: usize,
        first_crash: usize,
    },

    /// Re-probing the converged bracket contradicted the search.
    #[error(
        "Crash oracle is inconsistent: lengths {last_safe}/{first_crash} did not reproduce survive/crash"
    )]
    Inconsistent { last_safe: usize, first_crash: usize },

    #[error("max probe length must be at least 1")]
    ZeroMaxProbe,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The transition between the longest surviving and the shortest crashing payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetBracket {
    pub last_safe: usize,
    pub first_crash: usize,
}

impl OffsetBracket {
    /// Padding length that reaches up to, but not into, the canary.
    pub fn offset(&self) -> usize {
        self.last_safe
    }
}

#[derive(Debug, Clone)]
pub struct DiscoverParams {
    /// Longest padding ever sent.
    pub max_probe: usize,
    pub pad: u8,
    /// Sent before the padding; lengths count padding bytes only.
    pub prefix: Vec<u8>,
    pub timeout: Duration,
}

impl DiscoverParams {
    pub fn new(max_probe: usize, pad: u8, timeout: Duration) -> Self {
        Self {
            max_probe,
            pad,
            prefix: Vec::new(),
            timeout,
        }
    }

    pub fn with_prefix(mut self, prefix: Vec<u8>) -> Self {
        self.prefix = prefix;
        self
    }
}

/// Finds the shortest crashing padding length by exponential probing followed by
/// binary search.
///
/// Lengths 1, 2, 4, ... are probed until one crashes. If doubling would pass
/// `max_probe`, `max_probe` itself is probed once; if that survives the search
/// fails with [`DiscoverError::NoCrash`]. The bracket is then bisected, capped at
/// [`MAX_BISECT_ITERATIONS`], and the final pair is re-probed so an oracle that
/// answers differently for identical payloads yields
/// [`DiscoverError::Inconsistent`] instead of a wrong offset.
///
/// On success `first_crash == last_safe + 1`.
pub fn discover(
    transport: &mut dyn Transport,
    params: &DiscoverParams,
) -> Result<OffsetBracket, DiscoverError> {
    if params.max_probe == 0 {
        return Err(DiscoverError::ZeroMaxProbe);
    }
    let builder = PayloadBuilder::new(&params.prefix, params.pad);
    let mut oracle = CrashOracle::new(transport, params.timeout);

    let mut good = 0;
    let mut bad = 1;
    loop {
        if !oracle.survives(&builder.padded(bad))? {
            break;
        }
        good = bad;
        if good >= params.max_probe {
            return Err(DiscoverError::NoCrash {
                max_probe: params.max_probe,
            });
        }
        bad = bad.saturating_mul(2).min(params.max_probe);
        debug!("length {good} survived, next probe {bad}");
    }
    debug!("crash bracket found: {good}..{bad}");

    let mut iterations = 0;
    while bad - good > 1 {
        if iterations == MAX_BISECT_ITERATIONS {
            return Err(DiscoverError::NotConverged {
                iterations,
                last_safe: good,
                first_crash: bad,
            });
        }
        iterations += 1;
        let mid = good + (bad - good) / 2;
        if oracle.survives(&builder.padded(mid))? {
            good = mid;
        } else {
            bad = mid;
        }
    }

    let bracket = OffsetBracket {
        last_safe: good,
        first_crash: bad,
    };
    verify(&mut oracle, &builder, bracket)?;
    info!(
        "Offset discovered: {} bytes (first crash at {}, {} probes)",
        bracket.last_safe,
        bracket.first_crash,
        oracle.probes()
    );
    Ok(bracket)
}

/// Probes lengths `1..=max_probe` in order and stops at the first crash.
///
/// Slower than [`discover`] but never relies on the crash threshold being
/// monotonic.
pub fn discover_linear(
    transport: &mut dyn Transport,
    params: &DiscoverParams,
) -> Result<OffsetBracket, DiscoverError> {
    if params.max_probe == 0 {
        return Err(DiscoverError::ZeroMaxProbe);
    }
    let builder = PayloadBuilder::new(&params.prefix, params.pad);
    let mut oracle = CrashOracle::new(transport, params.timeout);

    for len in 1..=params.max_probe {
        if !oracle.survives(&builder.padded(len))? {
            let bracket = OffsetBracket {
                last_safe: len - 1,
                first_crash: len,
            };
            info!(
                "Offset discovered: {} bytes ({} probes)",
                bracket.last_safe,
                oracle.probes()
            );
            return Ok(bracket);
        }
    }
    Err(DiscoverError::NoCrash {
        max_probe: params.max_probe,
    })
}

fn verify(
    oracle: &mut CrashOracle<'_>,
    builder: &PayloadBuilder<'_>,
    bracket: OffsetBracket,
) -> Result<(), DiscoverError> {
    // Zero padding was never probed; it is assumed safe.
    let safe_holds = bracket.last_safe == 0 || oracle.survives(&builder.padded(bracket.last_safe))?;
    let crash_holds = !oracle.survives(&builder.padded(bracket.first_crash))?;
    if safe_holds && crash_holds {
        Ok(())
    } else {
        Err(DiscoverError::Inconsistent {
            last_safe: bracket.last_safe,
            first_crash: bracket.first_crash,
        })
    }
}
