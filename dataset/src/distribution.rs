//! Sequence length distribution specs
//!
//! A distribution string such as `"256,128:60;1024,256:40"` defines
//! weighted `(isl, osl)` buckets: 60% of conversations draw 256 input /
//! 128 output tokens, 40% draw 1024/256. An optional per-bucket standard
//! deviation (`"256,128:60:16"`) turns the bucket into a normal draw
//! around its lengths. Sampled values are clamped to at least one token.

use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use inferload_core::error::{Error, Result};

/// One weighted `(isl, osl)` bucket
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceBucket {
    /// Input sequence length
    pub isl: f64,
    /// Output sequence length
    pub osl: f64,
    /// Relative probability weight
    pub prob: f64,
    /// Optional normal spread around both lengths
    pub stddev: Option<f64>,
}

/// A parsed sequence distribution
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceDistribution {
    buckets: Vec<SequenceBucket>,
    total_weight: f64,
}

impl SequenceDistribution {
    /// Parse a distribution spec string.
    ///
    /// Grammar: `bucket(';'bucket)*` with `bucket = isl','osl':'prob[':'stddev]`.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut buckets = Vec::new();
        for part in spec.split(';').filter(|part| !part.trim().is_empty()) {
            buckets.push(parse_bucket(part.trim())?);
        }
        if buckets.is_empty() {
            return Err(Error::Config(format!(
                "sequence distribution '{spec}' has no buckets"
            )));
        }
        let total_weight = buckets.iter().map(|bucket| bucket.prob).sum();
        if total_weight <= 0.0 {
            return Err(Error::Config(
                "sequence distribution weights must sum to a positive value".into(),
            ));
        }
        Ok(Self {
            buckets,
            total_weight,
        })
    }

    /// Draw an `(isl, osl)` pair
    pub fn sample(&self, rng: &mut StdRng) -> Result<(u64, u64)> {
        let mut point = rng.gen::<f64>() * self.total_weight;
        let mut chosen = self.buckets.last().expect("parse guarantees buckets");
        for bucket in &self.buckets {
            if point < bucket.prob {
                chosen = bucket;
                break;
            }
            point -= bucket.prob;
        }

        match chosen.stddev {
            None => Ok((clamp_tokens(chosen.isl), clamp_tokens(chosen.osl))),
            Some(stddev) => {
                let isl = Normal::new(chosen.isl, stddev)
                    .map_err(|e| Error::Config(format!("invalid bucket stddev: {e}")))?
                    .sample(rng);
                let osl = Normal::new(chosen.osl, stddev)
                    .map_err(|e| Error::Config(format!("invalid bucket stddev: {e}")))?
                    .sample(rng);
                Ok((clamp_tokens(isl), clamp_tokens(osl)))
            }
        }
    }

    /// The parsed buckets
    pub fn buckets(&self) -> &[SequenceBucket] {
        &self.buckets
    }
}

fn parse_bucket(part: &str) -> Result<SequenceBucket> {
    let bad = || Error::Config(format!("sequence distribution bucket '{part}' is not of the form isl,osl:prob[:stddev]"));

    let (lengths, weight) = part.split_once(':').ok_or_else(bad)?;
    let (isl, osl) = lengths.split_once(',').ok_or_else(bad)?;
    let (prob, stddev) = match weight.split_once(':') {
        Some((prob, stddev)) => (prob, Some(stddev)),
        None => (weight, None),
    };

    let parse_num = |text: &str| text.trim().parse::<f64>().map_err(|_| bad());
    let bucket = SequenceBucket {
        isl: parse_num(isl)?,
        osl: parse_num(osl)?,
        prob: parse_num(prob)?,
        stddev: stddev.map(parse_num).transpose()?,
    };
    if bucket.prob < 0.0 || bucket.isl < 1.0 || bucket.osl < 1.0 {
        return Err(bad());
    }
    Ok(bucket)
}

/// Clamp a sampled length to at least one token
pub fn clamp_tokens(value: f64) -> u64 {
    value.round().max(1.0) as u64
}
