use super::Error;
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};

/// Delay before a failed job becomes eligible again, by error count.
///
/// Every curve is non-decreasing in the error count and clamped to
/// `[MIN_DELAY_SECS, cap]`, so a failing job always cools down for at least
/// a second and never waits longer than its cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backoff")]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed {
        delay: u32,
    },
    /// `error_count ^ exponent + offset` seconds.
    Polynomial {
        exponent: u32,
        offset: u32,
        cap: u32,
    },
    /// `delay * fib(error_count)` seconds.
    Fibonacci {
        delay: u32,
        cap: u32,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Polynomial {
            exponent: 4,
            offset: 3,
            cap: Self::DEFAULT_CAP_SECS,
        }
    }
}

impl Backoff {
    pub const MIN_DELAY_SECS: u64 = 1;
    pub const DEFAULT_CAP_SECS: u32 = 30 * 24 * 60 * 60;

    pub const fn fibonacci(idx: usize) -> u32 {
        if idx >= Self::FIB_ARRAY.len() {
            return Self::FIB_ARRAY[31];
        }
        Self::FIB_ARRAY[idx]
    }

    const FIB_ARRAY: [u32; 32] = Self::fib_array::<32>();

    const fn fib_array<const N: usize>() -> [u32; N] {
        let mut x = [1; N];
        let mut i: usize = 2;
        while i < N {
            let next_x = x[i - 1] + x[i - 2];
            x[i] = next_x;
            i += 1;
        }
        x
    }

    pub fn delay(&self, error_count: u32) -> Duration {
        let secs = match *self {
            Backoff::Fixed { delay } => u64::from(delay),
            Backoff::Polynomial {
                exponent,
                offset,
                cap,
            } => u64::from(error_count)
                .saturating_pow(exponent)
                .saturating_add(u64::from(offset))
                .min(u64::from(cap)),
            Backoff::Fibonacci { delay, cap } => u64::from(delay)
                .saturating_mul(u64::from(Self::fibonacci(error_count as usize)))
                .min(u64::from(cap)),
        };
        Duration::from_secs(secs.max(Self::MIN_DELAY_SECS))
    }
}

fn parse_secs(s: &str) -> Result<u32, Error> {
    s.trim().parse().map_err(|_| Error::InvalidParams("backoff"))
}

impl FromStr for Backoff {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Backoff::default());
        }
        let parts: Vec<&str> = s.split(['|', ',']).collect();
        match (parts[0], parts.len()) {
            ("fixed", 2) => Ok(Backoff::Fixed {
                delay: parse_secs(parts[1])?,
            }),
            ("polynomial", 3 | 4) => Ok(Backoff::Polynomial {
                exponent: parse_secs(parts[1])?,
                offset: parse_secs(parts[2])?,
                cap: match parts.get(3) {
                    Some(cap) => parse_secs(cap)?,
                    None => Self::DEFAULT_CAP_SECS,
                },
            }),
            ("fibonacci" | "exponential", 2 | 3) => Ok(Backoff::Fibonacci {
                delay: parse_secs(parts[1])?,
                cap: match parts.get(2) {
                    Some(cap) => parse_secs(cap)?,
                    None => Self::DEFAULT_CAP_SECS,
                },
            }),
            _ => Err(Error::InvalidParams("backoff")),
        }
    }
}

#[cfg(test)]
fn assert_non_decreasing(backoff: Backoff) {
    let mut prev = backoff.delay(0);
    for n in 1..200 {
        let next = backoff.delay(n);
        assert!(next >= prev, "{backoff:?} decreased at {n}");
        prev = next;
    }
}

#[tokio::test]
async fn backoff_default_matches_polynomial_curve() -> anyhow::Result<()> {
    // arrange
    let backoff = Backoff::default();

    // act & assert
    assert_eq!(Duration::from_secs(3), backoff.delay(0));
    assert_eq!(Duration::from_secs(4), backoff.delay(1));
    assert_eq!(Duration::from_secs(19), backoff.delay(2));
    assert_eq!(Duration::from_secs(84), backoff.delay(3));
    Ok(())
}

#[tokio::test]
async fn backoff_is_non_decreasing() -> anyhow::Result<()> {
    assert_non_decreasing(Backoff::default());
    assert_non_decreasing(Backoff::Fixed { delay: 7 });
    assert_non_decreasing(Backoff::Fibonacci {
        delay: 2,
        cap: 3600,
    });
    assert_non_decreasing(Backoff::Polynomial {
        exponent: 10,
        offset: 0,
        cap: u32::MAX,
    });
    Ok(())
}

#[tokio::test]
async fn backoff_saturates_at_cap() -> anyhow::Result<()> {
    // arrange
    let backoff = Backoff::Polynomial {
        exponent: 4,
        offset: 3,
        cap: 600,
    };

    // act & assert
    assert_eq!(Duration::from_secs(600), backoff.delay(5));
    assert_eq!(Duration::from_secs(600), backoff.delay(u32::MAX));
    Ok(())
}

#[tokio::test]
async fn backoff_never_zero() -> anyhow::Result<()> {
    // arrange
    let curves = [
        Backoff::Fixed { delay: 0 },
        Backoff::Polynomial {
            exponent: 1,
            offset: 0,
            cap: 0,
        },
        Backoff::Fibonacci { delay: 0, cap: 10 },
    ];

    // act & assert
    for backoff in curves {
        for n in 0..10 {
            assert!(backoff.delay(n) >= Duration::from_secs(Backoff::MIN_DELAY_SECS));
        }
    }
    Ok(())
}

#[tokio::test]
async fn backoff_from_str_empty() -> anyhow::Result<()> {
    // arrange
    let s = "";
    // act
    let backoff: Backoff = s.parse()?;

    // assert
    assert_eq!(Backoff::default(), backoff);
    Ok(())
}

#[tokio::test]
async fn backoff_from_str_variants() -> anyhow::Result<()> {
    assert_eq!(Backoff::Fixed { delay: 30 }, "fixed|30".parse::<Backoff>()?);
    assert_eq!(
        Backoff::Polynomial {
            exponent: 2,
            offset: 5,
            cap: Backoff::DEFAULT_CAP_SECS
        },
        "polynomial|2|5".parse::<Backoff>()?
    );
    assert_eq!(
        Backoff::Fibonacci {
            delay: 15,
            cap: 3600
        },
        "fibonacci,15,3600".parse::<Backoff>()?
    );
    Ok(())
}

#[tokio::test]
async fn backoff_from_str_err() -> anyhow::Result<()> {
    // arrange
    let inputs = ["test", "fixed", "fixed|x", "polynomial|4", "fibonacci|1|2|3"];

    // act & assert
    for s in inputs {
        let backoff: Result<Backoff, _> = s.parse();
        assert!(backoff.is_err(), "{s} should not parse");
    }
    Ok(())
}
