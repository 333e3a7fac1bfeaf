//! Positioning sources the agent can feed into the pipeline.
//!
//! - [`SimulatedSource`]: a random walk from a fixed origin, one fix per
//!   interval, with occasional loss of fix.
//! - [`LineSource`]: one position per line (`lat,lon` or
//!   `lat,lon,<RFC 3339 timestamp>`), typically standard input.

use std::time::Duration;

use futures::Stream;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Stdin};
use tokio::time::{MissedTickBehavior, interval};

use trackline_core::CaptureError;
use trackline_types::Sample;

/// Item type produced by every source.
pub type CaptureResult = Result<Sample, CaptureError>;

/// Random-walk positioning source.
#[derive(Debug, Clone)]
pub struct SimulatedSource {
    latitude: f64,
    longitude: f64,
    interval: Duration,
    step_degrees: f64,
    dropout: f64,
    seed: Option<u64>,
}

impl SimulatedSource {
    /// Default maximum movement per fix, roughly 100 m.
    pub const DEFAULT_STEP: f64 = 0.001;

    pub fn new(latitude: f64, longitude: f64, interval: Duration) -> Self {
        Self {
            latitude,
            longitude,
            interval,
            step_degrees: Self::DEFAULT_STEP,
            dropout: 0.0,
            seed: None,
        }
    }

    /// Maximum movement per fix in degrees.
    #[must_use]
    pub fn step(mut self, degrees: f64) -> Self {
        self.step_degrees = degrees.abs();
        self
    }

    /// Probability in `[0, 1]` that a fix is unavailable.
    #[must_use]
    pub fn dropout(mut self, probability: f64) -> Self {
        self.dropout = probability.clamp(0.0, 1.0);
        self
    }

    /// Make the walk reproducible.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Infinite stream of fixes, the first one immediately.
    pub fn into_stream(self) -> impl Stream<Item = CaptureResult> + Send + 'static {
        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let mut ticker = interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        futures::stream::unfold((self, rng, ticker), |(mut walk, mut rng, mut ticker)| async move {
            ticker.tick().await;
            let item = walk.next_fix(&mut rng);
            Some((item, (walk, rng, ticker)))
        })
    }

    fn next_fix(&mut self, rng: &mut StdRng) -> CaptureResult {
        if self.dropout > 0.0 && rng.random_bool(self.dropout) {
            return Err(CaptureError::Unavailable("simulated loss of fix".to_string()));
        }

        if self.step_degrees > 0.0 {
            let step = self.step_degrees;
            self.latitude = (self.latitude + rng.random_range(-step..=step)).clamp(-90.0, 90.0);
            self.longitude = wrap_longitude(self.longitude + rng.random_range(-step..=step));
        }

        Ok(Sample::now(self.latitude, self.longitude)?)
    }
}

fn wrap_longitude(longitude: f64) -> f64 {
    if longitude > 180.0 {
        longitude - 360.0
    } else if longitude < -180.0 {
        longitude + 360.0
    } else {
        longitude
    }
}

/// Source reading one position per line.
///
/// Blank lines and lines starting with `#` are skipped. Unparseable lines
/// yield an error item and reading continues. The stream ends at EOF.
#[derive(Debug)]
pub struct LineSource<R> {
    reader: R,
}

impl LineSource<BufReader<Stdin>> {
    /// Read positions from standard input.
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

impl<R> LineSource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    pub fn into_stream(self) -> impl Stream<Item = CaptureResult> + Send + 'static {
        futures::stream::unfold(self.reader.lines(), |mut lines| async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(item) = parse_line(&line) {
                            return Some((item, lines));
                        }
                    }
                    Ok(None) => return None,
                    Err(e) => return Some((Err(CaptureError::Io(e)), lines)),
                }
            }
        })
    }
}

/// Parse `lat,lon[,timestamp]`. Returns `None` for lines to skip.
///
/// A line without a timestamp is stamped with the current time.
pub fn parse_line(line: &str) -> Option<CaptureResult> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if !(2..=3).contains(&fields.len()) {
        return Some(Err(CaptureError::Malformed(format!(
            "expected 'lat,lon[,timestamp]', got '{}'",
            line
        ))));
    }

    let parse_coordinate = |s: &str, name: &str| {
        s.parse::<f64>()
            .map_err(|_| CaptureError::Malformed(format!("invalid {} '{}'", name, s)))
    };

    let result = (|| -> CaptureResult {
        let latitude = parse_coordinate(fields[0], "latitude")?;
        let longitude = parse_coordinate(fields[1], "longitude")?;
        let captured_at = match fields.get(2) {
            Some(ts) => OffsetDateTime::parse(ts, &Rfc3339)
                .map_err(|e| CaptureError::Malformed(format!("invalid timestamp '{}': {}", ts, e)))?,
            None => OffsetDateTime::now_utc(),
        };
        Ok(Sample::new(latitude, longitude, captured_at)?)
    })();

    Some(result)
}
