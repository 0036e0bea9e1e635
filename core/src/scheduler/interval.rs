//! Inter-arrival interval generators for rate mode

use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;

/// Generates the sleep between consecutive credit emissions
pub enum ArrivalProcess {
    /// Fixed interval `1/rate`
    Constant {
        /// The fixed interval
        interval: Duration,
    },
    /// Exponential inter-arrivals `-ln(U)/rate`, U uniform in (0, 1]
    Poisson {
        /// Target rate in requests per second
        rate: f64,
        /// Derived RNG for the uniform draws
        rng: StdRng,
    },
}

impl ArrivalProcess {
    /// Constant process at the given rate
    pub fn constant(rate: f64) -> Self {
        Self::Constant {
            interval: Duration::from_secs_f64(1.0 / rate),
        }
    }

    /// Poisson process at the given rate
    pub fn poisson(rate: f64, rng: StdRng) -> Self {
        Self::Poisson { rate, rng }
    }

    /// Draw the next inter-arrival interval
    pub fn next_interval(&mut self) -> Duration {
        match self {
            ArrivalProcess::Constant { interval } => *interval,
            ArrivalProcess::Poisson { rate, rng } => {
                // gen() is uniform in [0, 1); flip it to (0, 1] so ln() is
                // always finite
                let uniform: f64 = 1.0 - rng.gen::<f64>();
                Duration::from_secs_f64(-uniform.ln() / *rate)
            }
        }
    }
}

impl std::fmt::Debug for ArrivalProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArrivalProcess::Constant { interval } => f
                .debug_struct("Constant")
                .field("interval", interval)
                .finish(),
            ArrivalProcess::Poisson { rate, .. } => {
                f.debug_struct("Poisson").field("rate", rate).finish()
            }
        }
    }
}
