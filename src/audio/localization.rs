//! TDOA sound source localization for a 4-microphone array.
//!
//! Channel 0 is the reference microphone. For each of the other three
//! channels the delay with the highest normalized cross-correlation gives a
//! time difference of arrival; the three range differences are then solved
//! for a direction vector by least squares (2D for coplanar arrays, 3D
//! otherwise) and optionally smoothed across frames.

use std::fs;
use std::ops::{Add, Mul, Sub};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

const DEFAULT_EDGE_LENGTH: f32 = 0.08;
const PLANAR_VOLUME_EPS: f32 = 1e-6;
const SINGULAR_DET_EPS: f32 = 1e-10;
const CORRELATION_ENERGY_EPS: f32 = 1e-10;
const SILENCE_RMS: f64 = 1e-12;

/// Loudness reported for a silent channel.
pub const SILENCE_FLOOR_DB: f64 = -120.0;

// ======================== Vec3 ========================

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn dot(&self, other: &Vec3) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(&self, other: &Vec3) -> Vec3 {
        Vec3::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    pub fn magnitude(&self) -> f32 {
        self.dot(self).sqrt()
    }

    /// Unit vector in the same direction; the zero vector stays zero.
    pub fn normalize(&self) -> Vec3 {
        let mag = self.magnitude();
        if mag > 1e-6 {
            Vec3::new(self.x / mag, self.y / mag, self.z / mag)
        } else {
            Vec3::default()
        }
    }
}

impl Add for Vec3 {
    type Output = Vec3;
    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Vec3;
    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Vec3;
    fn mul(self, s: f32) -> Vec3 {
        Vec3::new(self.x * s, self.y * s, self.z * s)
    }
}

// ======================== Array geometry ========================

/// Regular tetrahedron centred on the origin with one apex on +z.
pub fn tetrahedron_positions(edge_length: f32) -> [Vec3; 4] {
    let a = edge_length;
    let h = a * (2.0f32 / 3.0).sqrt();
    let r = a / 3.0f32.sqrt();
    let half_chord = r * 3.0f32.sqrt() / 2.0;
    [
        Vec3::new(0.0, 0.0, h * 0.75),
        Vec3::new(r, 0.0, -h * 0.25),
        Vec3::new(-r * 0.5, half_chord, -h * 0.25),
        Vec3::new(-r * 0.5, -half_chord, -h * 0.25),
    ]
}

/// Square in the z=0 plane, counter-clockwise from the top-left corner.
pub fn square_positions(edge_length: f32) -> [Vec3; 4] {
    let half = edge_length / 2.0;
    [
        Vec3::new(-half, half, 0.0),
        Vec3::new(-half, -half, 0.0),
        Vec3::new(half, -half, 0.0),
        Vec3::new(half, half, 0.0),
    ]
}

/// True when the four points are coplanar (six times the tetrahedron volume is ~0).
pub fn is_planar_array(positions: &[Vec3; 4]) -> bool {
    let v1 = positions[1] - positions[0];
    let v2 = positions[2] - positions[0];
    let v3 = positions[3] - positions[0];
    v1.dot(&v2.cross(&v3)).abs() < PLANAR_VOLUME_EPS
}

/// Localization parameters and microphone geometry.
///
/// Positions are fixed at construction; `is_planar` always reflects them.
#[derive(Debug, Clone)]
pub struct MicArrayConfig {
    pub array_type: String,
    pub sample_rate: u32,
    pub frame_size: usize,
    pub max_delay_samples: i32,
    pub channels: u32,
    pub audio_gain: f32,
    pub sound_speed: f32,
    pub min_confidence: f32,
    pub smoothing_enabled: bool,
    pub smoothing_alpha: f32,
    mic_positions: [Vec3; 4],
    is_planar: bool,
}

impl Default for MicArrayConfig {
    fn default() -> Self {
        Self::with_positions("tetrahedron", tetrahedron_positions(DEFAULT_EDGE_LENGTH))
    }
}

impl MicArrayConfig {
    /// Default parameters with an explicit geometry.
    pub fn with_positions(array_type: &str, mic_positions: [Vec3; 4]) -> Self {
        Self {
            array_type: array_type.to_string(),
            sample_rate: 48000,
            frame_size: 1024,
            max_delay_samples: 64,
            channels: 4,
            audio_gain: 1.0,
            sound_speed: 343.0,
            min_confidence: 0.3,
            smoothing_enabled: true,
            smoothing_alpha: 0.3,
            is_planar: is_planar_array(&mic_positions),
            mic_positions,
        }
    }

    pub fn tetrahedron(edge_length: f32) -> Self {
        Self::with_positions("tetrahedron", tetrahedron_positions(edge_length))
    }

    pub fn square(edge_length: f32) -> Self {
        Self::with_positions("square", square_positions(edge_length))
    }

    pub fn mic_positions(&self) -> &[Vec3; 4] {
        &self.mic_positions
    }

    pub fn is_planar(&self) -> bool {
        self.is_planar
    }

    /// Load a geometry file. Never fails: on any read or parse error the
    /// regular 8 cm tetrahedron defaults are returned.
    pub fn load(path: impl AsRef<Path>) -> MicArrayConfig {
        let path = path.as_ref();
        log::info!("Loading microphone array configuration from: {}", path.display());
        match Self::try_load(path) {
            Ok(config) => {
                log::info!(
                    "Mic array config loaded: type={}, planar={}, rate={}, frame={}, max_delay={}, ch={}",
                    config.array_type,
                    config.is_planar,
                    config.sample_rate,
                    config.frame_size,
                    config.max_delay_samples,
                    config.channels,
                );
                config
            }
            Err(e) => {
                log::error!("Failed to load mic array config: {:#}", e);
                log::error!("Falling back to default tetrahedron array");
                MicArrayConfig::default()
            }
        }
    }

    fn try_load(path: &Path) -> Result<MicArrayConfig> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read '{}'", path.display()))?;
        let file: GeometryFile = serde_yml::from_str(&text)
            .with_context(|| format!("Failed to parse '{}'", path.display()))?;
        Ok(file.into_config())
    }
}

// ---------- YAML layout ----------

#[derive(Debug, Default, Deserialize)]
struct GeometryFile {
    #[serde(default)]
    microphones: Option<MicrophonesSection>,
    #[serde(default)]
    audio: Option<AudioSection>,
    #[serde(default)]
    environment: Option<EnvironmentSection>,
    #[serde(default)]
    localization: Option<LocalizationSection>,
}

#[derive(Debug, Default, Deserialize)]
struct MicrophonesSection {
    array_type: Option<String>,
    tetrahedron: Option<PresetSection>,
    square: Option<PresetSection>,
    positions: Option<PositionsSection>,
}

#[derive(Debug, Default, Deserialize)]
struct PresetSection {
    edge_length: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct PositionsSection {
    mic_0: Option<Vec3>,
    mic_1: Option<Vec3>,
    mic_2: Option<Vec3>,
    mic_3: Option<Vec3>,
}

#[derive(Debug, Default, Deserialize)]
struct AudioSection {
    sample_rate: Option<u32>,
    frame_size: Option<usize>,
    max_delay_samples: Option<i32>,
    channels: Option<u32>,
    gain: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct EnvironmentSection {
    sound_speed: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct LocalizationSection {
    min_confidence: Option<f32>,
    smoothing: Option<SmoothingSection>,
}

#[derive(Debug, Default, Deserialize)]
struct SmoothingSection {
    enabled: Option<bool>,
    alpha: Option<f32>,
}

impl GeometryFile {
    fn into_config(self) -> MicArrayConfig {
        let mics = self.microphones.unwrap_or_default();
        let array_type = mics.array_type.unwrap_or_else(|| "tetrahedron".to_string());

        // A preset needs its own section; otherwise fall through to explicit positions
        let mut config = match (array_type.as_str(), mics.tetrahedron, mics.square) {
            ("tetrahedron", Some(preset), _) => {
                let edge = preset.edge_length.unwrap_or(DEFAULT_EDGE_LENGTH);
                log::info!("Using tetrahedron array, edge {:.1} cm", edge * 100.0);
                MicArrayConfig::tetrahedron(edge)
            }
            ("square", _, Some(preset)) => {
                let edge = preset.edge_length.unwrap_or(DEFAULT_EDGE_LENGTH);
                log::info!("Using square array, edge {:.1} cm", edge * 100.0);
                MicArrayConfig::square(edge)
            }
            _ => match mics.positions {
                Some(p) => {
                    let mut positions = tetrahedron_positions(DEFAULT_EDGE_LENGTH);
                    for (slot, mic) in positions
                        .iter_mut()
                        .zip([p.mic_0, p.mic_1, p.mic_2, p.mic_3])
                    {
                        if let Some(mic) = mic {
                            *slot = mic;
                        }
                    }
                    log::info!("Using custom microphone positions ({})", array_type);
                    MicArrayConfig::with_positions(&array_type, positions)
                }
                None => {
                    log::warn!(
                        "Array type '{}' has neither a preset section nor positions, using default tetrahedron",
                        array_type
                    );
                    MicArrayConfig::default()
                }
            },
        };

        if let Some(audio) = self.audio {
            if let Some(v) = audio.sample_rate {
                config.sample_rate = v;
            }
            if let Some(v) = audio.frame_size {
                config.frame_size = v;
            }
            if let Some(v) = audio.max_delay_samples {
                config.max_delay_samples = v.max(0);
            }
            if let Some(v) = audio.channels {
                config.channels = v;
            }
            if let Some(v) = audio.gain {
                config.audio_gain = v.max(0.0);
            }
        }

        if let Some(v) = self.environment.and_then(|e| e.sound_speed) {
            config.sound_speed = v;
        }

        if let Some(loc) = self.localization {
            if let Some(v) = loc.min_confidence {
                config.min_confidence = v;
            }
            if let Some(smoothing) = loc.smoothing {
                if let Some(v) = smoothing.enabled {
                    config.smoothing_enabled = v;
                }
                if let Some(v) = smoothing.alpha {
                    if !(0.0..=1.0).contains(&v) {
                        log::warn!("smoothing alpha {} out of [0, 1], clamping", v);
                    }
                    config.smoothing_alpha = v.clamp(0.0, 1.0);
                }
            }
        }

        config
    }
}

// ======================== Localizer ========================

/// One direction estimate in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionEstimate {
    pub azimuth: f32,
    pub elevation: f32,
    pub confidence: f32,
}

pub struct MicArrayLocalizer {
    config: MicArrayConfig,
    smoothed_direction: Vec3,
    first_result: bool,
    max_theoretical_delay: i32,
}

impl MicArrayLocalizer {
    pub fn new(config: MicArrayConfig) -> Self {
        let positions = config.mic_positions();
        let mut max_dist = 0.0f32;
        for i in 0..4 {
            for j in (i + 1)..4 {
                max_dist = max_dist.max((positions[j] - positions[i]).magnitude());
            }
        }
        let max_theoretical_delay =
            (max_dist / config.sound_speed * config.sample_rate as f32) as i32 + 1;

        log::info!(
            "Localizer ready: planar={}, max_delay_samples={}, theoretical max delay={}",
            config.is_planar(),
            config.max_delay_samples,
            max_theoretical_delay,
        );

        Self {
            config,
            smoothed_direction: Vec3::new(1.0, 0.0, 0.0),
            first_result: true,
            max_theoretical_delay,
        }
    }

    pub fn config(&self) -> &MicArrayConfig {
        &self.config
    }

    /// Largest physically possible inter-mic delay in samples (informational).
    #[allow(dead_code)]
    pub fn max_theoretical_delay(&self) -> i32 {
        self.max_theoretical_delay
    }

    /// Estimate the dominant source direction from four synchronized channels.
    ///
    /// Returns `None` when the geometry system is singular or there is no
    /// audio to correlate; the smoothing state is left untouched in that case.
    pub fn localize(
        &mut self,
        channels: &[Vec<f32>; 4],
        num_samples: usize,
    ) -> Option<DirectionEstimate> {
        let len = channels
            .iter()
            .map(Vec::len)
            .fold(num_samples, usize::min);
        if len == 0 {
            return None;
        }

        let mut tdoa = [0.0f32; 3];
        let mut total_correlation = 0.0f32;
        for i in 1..4 {
            let (corr, delay) = compute_cross_correlation(
                &channels[0][..len],
                &channels[i][..len],
                self.config.max_delay_samples,
            );
            tdoa[i - 1] = -(delay as f32) / self.config.sample_rate as f32;
            total_correlation += corr;
        }
        let confidence = total_correlation / 3.0;

        let direction = self.direction_from_tdoa(&tdoa)?;

        Some(DirectionEstimate {
            azimuth: direction.y.atan2(direction.x).to_degrees(),
            elevation: direction.z.clamp(-1.0, 1.0).asin().to_degrees(),
            confidence,
        })
    }

    /// Solve, normalize and (if enabled) smooth a direction from three TDOAs.
    fn direction_from_tdoa(&mut self, tdoa: &[f32; 3]) -> Option<Vec3> {
        let solved = if self.config.is_planar() {
            self.solve_2d(tdoa)
        } else {
            self.solve_3d(tdoa)
        };
        let raw = solved?.normalize();

        if !self.config.smoothing_enabled {
            return Some(raw);
        }

        if self.first_result {
            self.smoothed_direction = raw;
            self.first_result = false;
        } else {
            let alpha = self.config.smoothing_alpha;
            self.smoothed_direction =
                (raw * alpha + self.smoothed_direction * (1.0 - alpha)).normalize();
        }
        Some(self.smoothed_direction)
    }

    /// Range-difference rows `(mic_i - mic_0, tdoa_i * c)` for i = 1..3.
    fn constraint_rows(&self, tdoa: &[f32; 3]) -> [(Vec3, f32); 3] {
        let p = self.config.mic_positions();
        let c = self.config.sound_speed;
        [
            (p[1] - p[0], tdoa[0] * c),
            (p[2] - p[0], tdoa[1] * c),
            (p[3] - p[0], tdoa[2] * c),
        ]
    }

    /// Least squares over x/y for coplanar arrays; z of the result is 0.
    fn solve_2d(&self, tdoa: &[f32; 3]) -> Option<Vec3> {
        let mut a = [[0.0f32; 2]; 2];
        let mut b = [0.0f32; 2];
        for (diff, range) in self.constraint_rows(tdoa) {
            a[0][0] += diff.x * diff.x;
            a[0][1] += diff.x * diff.y;
            a[1][0] += diff.y * diff.x;
            a[1][1] += diff.y * diff.y;
            b[0] += diff.x * range;
            b[1] += diff.y * range;
        }

        let det = a[0][0] * a[1][1] - a[0][1] * a[1][0];
        if det.abs() < SINGULAR_DET_EPS {
            return None;
        }
        let inv_det = 1.0 / det;
        Some(Vec3::new(
            (a[1][1] * b[0] - a[0][1] * b[1]) * inv_det,
            (a[0][0] * b[1] - a[1][0] * b[0]) * inv_det,
            0.0,
        ))
    }

    /// Normal equations solved through the adjugate of the 3x3 system matrix.
    fn solve_3d(&self, tdoa: &[f32; 3]) -> Option<Vec3> {
        let mut a = [[0.0f32; 3]; 3];
        let mut b = [0.0f32; 3];
        for (diff, range) in self.constraint_rows(tdoa) {
            let d = [diff.x, diff.y, diff.z];
            for r in 0..3 {
                for c in 0..3 {
                    a[r][c] += d[r] * d[c];
                }
                b[r] += d[r] * range;
            }
        }

        let det = a[0][0] * (a[1][1] * a[2][2] - a[1][2] * a[2][1])
            - a[0][1] * (a[1][0] * a[2][2] - a[1][2] * a[2][0])
            + a[0][2] * (a[1][0] * a[2][1] - a[1][1] * a[2][0]);
        if det.abs() < SINGULAR_DET_EPS {
            return None;
        }
        let inv_det = 1.0 / det;

        let inv = [
            [
                (a[1][1] * a[2][2] - a[1][2] * a[2][1]) * inv_det,
                (a[0][2] * a[2][1] - a[0][1] * a[2][2]) * inv_det,
                (a[0][1] * a[1][2] - a[0][2] * a[1][1]) * inv_det,
            ],
            [
                (a[1][2] * a[2][0] - a[1][0] * a[2][2]) * inv_det,
                (a[0][0] * a[2][2] - a[0][2] * a[2][0]) * inv_det,
                (a[0][2] * a[1][0] - a[0][0] * a[1][2]) * inv_det,
            ],
            [
                (a[1][0] * a[2][1] - a[1][1] * a[2][0]) * inv_det,
                (a[0][1] * a[2][0] - a[0][0] * a[2][1]) * inv_det,
                (a[0][0] * a[1][1] - a[0][1] * a[1][0]) * inv_det,
            ],
        ];

        let row = |r: usize| inv[r][0] * b[0] + inv[r][1] * b[1] + inv[r][2] * b[2];
        Some(Vec3::new(row(0), row(1), row(2)))
    }
}

/// Normalized cross-correlation of `sig2` against `sig1` over
/// `[-max_delay, max_delay]`.
///
/// Each lag is normalized by the energy of the overlapping windows only.
/// Returns `(best_correlation, best_delay)`; ties keep the most negative delay.
pub fn compute_cross_correlation(sig1: &[f32], sig2: &[f32], max_delay: i32) -> (f32, i32) {
    let length = sig1.len().min(sig2.len()) as i64;
    let mut max_corr = f32::NEG_INFINITY;
    let mut best_delay = 0;

    for delay in -max_delay..=max_delay {
        let d = delay as i64;
        let start = d.max(0);
        let end = if d >= 0 { length } else { length + d };

        let mut corr = 0.0f32;
        let mut energy1 = 0.0f32;
        let mut energy2 = 0.0f32;
        for i in start..end.max(start) {
            let a = sig1[i as usize];
            let b = sig2[(i - d) as usize];
            corr += a * b;
            energy1 += a * a;
            energy2 += b * b;
        }

        let norm = (energy1 * energy2).sqrt();
        if norm > CORRELATION_ENERGY_EPS {
            corr /= norm;
        }
        if corr > max_corr {
            max_corr = corr;
            best_delay = delay;
        }
    }
    (max_corr, best_delay)
}

/// Per-channel RMS loudness in dBFS, floored at [`SILENCE_FLOOR_DB`].
pub fn calc_4ch_separate_db(channels: &[Vec<f32>; 4]) -> [f64; 4] {
    let mut db = [SILENCE_FLOOR_DB; 4];
    for (out, sig) in db.iter_mut().zip(channels.iter()) {
        let rms = if sig.is_empty() {
            0.0
        } else {
            let sum: f64 = sig.iter().map(|&v| v as f64 * v as f64).sum();
            (sum / sig.len() as f64).sqrt()
        };
        *out = if rms <= SILENCE_RMS {
            SILENCE_FLOOR_DB
        } else {
            20.0 * rms.log10()
        };
    }
    db
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn noise(len: usize, seed: u32) -> Vec<f32> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 8) as f32 / (1u32 << 24) as f32 * 2.0 - 1.0
            })
            .collect()
    }

    /// Channels where channel i lags the reference by `lags[i]` samples.
    fn lagged_channels(lags: [i32; 4], len: usize) -> [Vec<f32>; 4] {
        let pad = 32;
        let base = noise(len + 2 * pad, 7);
        let take = |lag: i32| -> Vec<f32> {
            let start = (pad as i32 - lag) as usize;
            base[start..start + len].to_vec()
        };
        [take(lags[0]), take(lags[1]), take(lags[2]), take(lags[3])]
    }

    fn no_smoothing(mut config: MicArrayConfig) -> MicArrayConfig {
        config.smoothing_enabled = false;
        config
    }

    #[test]
    fn identical_signals_correlate_at_zero_delay() {
        let sig = noise(512, 42);
        let (corr, delay) = compute_cross_correlation(&sig, &sig, 16);
        assert_eq!(delay, 0);
        assert!((corr - 1.0).abs() < 1e-4, "corr = {}", corr);
    }

    #[test]
    fn cross_correlation_finds_lag_sign() {
        let ch = lagged_channels([0, 5, -3, 0], 512);
        let (_, lag5) = compute_cross_correlation(&ch[0], &ch[1], 16);
        let (_, lag_neg3) = compute_cross_correlation(&ch[0], &ch[2], 16);
        // a lagging channel shows up as a negative best delay, i.e. a positive TDOA
        assert_eq!(lag5, -5);
        assert_eq!(lag_neg3, 3);
    }

    #[test]
    fn silent_signals_do_not_divide_by_zero() {
        let zeros = vec![0.0f32; 256];
        let (corr, _) = compute_cross_correlation(&zeros, &zeros, 8);
        assert_eq!(corr, 0.0);
    }

    #[test]
    fn planar_detection() {
        assert!(is_planar_array(&square_positions(0.08)));
        assert!(!is_planar_array(&tetrahedron_positions(0.08)));
        assert!(MicArrayConfig::square(0.1).is_planar());
        assert!(!MicArrayConfig::default().is_planar());
    }

    #[test]
    fn tetrahedron_edges_are_regular() {
        let p = tetrahedron_positions(0.08);
        for i in 0..4 {
            for j in (i + 1)..4 {
                let d = (p[j] - p[i]).magnitude();
                assert!((d - 0.08).abs() < 1e-5, "edge {}-{} = {}", i, j, d);
            }
        }
    }

    #[test]
    fn solve_2d_recovers_injected_direction() {
        let config = no_smoothing(MicArrayConfig::square(0.08));
        let localizer = MicArrayLocalizer::new(config.clone());
        let truth = Vec3::new(0.6, -0.8, 0.0);
        let p = config.mic_positions();
        let tdoa = [1, 2, 3].map(|i| (p[i] - p[0]).dot(&truth) / config.sound_speed);

        let solved = localizer.solve_2d(&tdoa).unwrap().normalize();
        assert!((solved - truth).magnitude() < 1e-4, "solved {:?}", solved);
        assert_eq!(solved.z, 0.0);
    }

    #[test]
    fn solve_3d_recovers_injected_direction() {
        let config = no_smoothing(MicArrayConfig::default());
        let localizer = MicArrayLocalizer::new(config.clone());
        let truth = Vec3::new(0.3, 0.4, -0.5).normalize();
        let p = config.mic_positions();
        let tdoa = [1, 2, 3].map(|i| (p[i] - p[0]).dot(&truth) / config.sound_speed);

        let solved = localizer.solve_3d(&tdoa).unwrap().normalize();
        assert!((solved - truth).magnitude() < 1e-3, "solved {:?}", solved);
    }

    #[test]
    fn zero_tdoa_on_tetrahedron_is_not_singular() {
        let mut localizer = MicArrayLocalizer::new(no_smoothing(MicArrayConfig::default()));
        let direction = localizer.direction_from_tdoa(&[0.0; 3]).unwrap();
        assert!(direction.x.is_finite() && direction.y.is_finite() && direction.z.is_finite());
        assert!(direction.magnitude() <= 1.0 + 1e-6);
    }

    #[test]
    fn collinear_array_is_singular() {
        let line = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.02, 0.0, 0.0),
            Vec3::new(0.04, 0.0, 0.0),
            Vec3::new(0.06, 0.0, 0.0),
        ];
        let config = MicArrayConfig::with_positions("custom", line);
        assert!(config.is_planar());
        let mut localizer = MicArrayLocalizer::new(config);
        assert!(localizer.direction_from_tdoa(&[1e-5, 2e-5, 3e-5]).is_none());
    }

    #[test]
    fn smoothing_alpha_one_tracks_raw_direction() {
        let mut config = MicArrayConfig::square(0.08);
        config.smoothing_alpha = 1.0;
        let mut localizer = MicArrayLocalizer::new(config.clone());
        let p = *config.mic_positions();

        for truth in [Vec3::new(1.0, 0.0, 0.0), Vec3::new(0.0, 1.0, 0.0), Vec3::new(-0.6, 0.8, 0.0)] {
            let tdoa = [1, 2, 3].map(|i| (p[i] - p[0]).dot(&truth) / config.sound_speed);
            let out = localizer.direction_from_tdoa(&tdoa).unwrap();
            assert!((out - truth).magnitude() < 1e-4, "{:?} vs {:?}", out, truth);
        }
    }

    #[test]
    fn smoothing_small_alpha_barely_moves() {
        let mut config = MicArrayConfig::square(0.08);
        config.smoothing_alpha = 0.001;
        let mut localizer = MicArrayLocalizer::new(config.clone());
        let p = *config.mic_positions();
        let tdoa_for = |truth: Vec3| [1, 2, 3].map(|i| (p[i] - p[0]).dot(&truth) / config.sound_speed);

        let first = localizer.direction_from_tdoa(&tdoa_for(Vec3::new(1.0, 0.0, 0.0))).unwrap();
        let second = localizer.direction_from_tdoa(&tdoa_for(Vec3::new(0.0, 1.0, 0.0))).unwrap();
        assert!((second - first).magnitude() < 0.01, "moved to {:?}", second);
    }

    #[test]
    fn localize_synthetic_square_source() {
        // 8 cm edge at 48 kHz with c = 480 m/s puts one edge at exactly 8 samples
        let mut config = no_smoothing(MicArrayConfig::square(0.08));
        config.sound_speed = 480.0;
        config.max_delay_samples = 16;
        let mut localizer = MicArrayLocalizer::new(config);

        // direction +x: mic 2 and 3 sit 8 cm further along x than mic 0
        let ch = lagged_channels([0, 0, 8, 8], 1024);
        let est = localizer.localize(&ch, 1024).unwrap();
        assert!(est.azimuth.abs() < 1e-3, "azimuth {}", est.azimuth);
        assert!(est.elevation.abs() < 1e-3);
        assert!((est.confidence - 1.0).abs() < 1e-3, "confidence {}", est.confidence);

        // direction +y: mic 1 and 2 sit 8 cm lower in y than mic 0
        let ch = lagged_channels([0, -8, -8, 0], 1024);
        let est = localizer.localize(&ch, 1024).unwrap();
        assert!((est.azimuth - 90.0).abs() < 1e-3, "azimuth {}", est.azimuth);
    }

    #[test]
    fn localize_without_samples_fails() {
        let mut localizer = MicArrayLocalizer::new(MicArrayConfig::default());
        let empty: [Vec<f32>; 4] = Default::default();
        assert!(localizer.localize(&empty, 0).is_none());
    }

    #[test]
    fn loudness_of_silence_is_floor() {
        let zeros: [Vec<f32>; 4] = std::array::from_fn(|_| vec![0.0; 1024]);
        assert_eq!(calc_4ch_separate_db(&zeros), [-120.0; 4]);
    }

    #[test]
    fn loudness_of_full_scale_square_wave_is_zero_db() {
        let square: Vec<f32> = (0..1024).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let half: Vec<f32> = square.iter().map(|v| v * 0.5).collect();
        let db = calc_4ch_separate_db(&[square.clone(), half, vec![], square]);
        assert!(db[0].abs() < 1e-9);
        assert!((db[1] + 6.0206).abs() < 1e-3);
        assert_eq!(db[2], -120.0);
    }

    #[test]
    fn max_theoretical_delay_from_geometry() {
        // 8 cm at 343 m/s and 48 kHz is 11.19 samples
        let localizer = MicArrayLocalizer::new(MicArrayConfig::default());
        assert_eq!(localizer.max_theoretical_delay(), 12);
    }

    #[test]
    fn load_square_preset_from_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
microphones:
  array_type: square
  square:
    edge_length: 0.1
audio:
  sample_rate: 16000
  frame_size: 512
  max_delay_samples: 20
  channels: 4
  gain: 2.0
environment:
  sound_speed: 340.0
localization:
  min_confidence: 0.5
  smoothing:
    enabled: false
    alpha: 0.7
"#
        )
        .unwrap();

        let config = MicArrayConfig::load(file.path());
        assert_eq!(config.array_type, "square");
        assert!(config.is_planar());
        assert_eq!(config.mic_positions()[2], Vec3::new(0.05, -0.05, 0.0));
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.frame_size, 512);
        assert_eq!(config.max_delay_samples, 20);
        assert_eq!(config.audio_gain, 2.0);
        assert_eq!(config.sound_speed, 340.0);
        assert_eq!(config.min_confidence, 0.5);
        assert!(!config.smoothing_enabled);
        assert_eq!(config.smoothing_alpha, 0.7);
    }

    #[test]
    fn load_custom_positions_from_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
microphones:
  array_type: custom
  positions:
    mic_0: {{ x: 0.0, y: 0.0, z: 0.0 }}
    mic_1: {{ x: 0.05, y: 0.0, z: 0.0 }}
    mic_2: {{ x: 0.0, y: 0.05, z: 0.0 }}
    mic_3: {{ x: 0.0, y: 0.0, z: 0.05 }}
"#
        )
        .unwrap();

        let config = MicArrayConfig::load(file.path());
        assert_eq!(config.array_type, "custom");
        assert!(!config.is_planar());
        assert_eq!(config.mic_positions()[3], Vec3::new(0.0, 0.0, 0.05));
        assert_eq!(config.sample_rate, 48000);
    }

    #[test]
    fn preset_type_without_section_uses_positions() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
microphones:
  array_type: tetrahedron
  positions:
    mic_0: {{ x: -0.05, y: 0.05, z: 0.0 }}
    mic_1: {{ x: -0.05, y: -0.05, z: 0.0 }}
    mic_2: {{ x: 0.05, y: -0.05, z: 0.0 }}
    mic_3: {{ x: 0.05, y: 0.05, z: 0.0 }}
"#
        )
        .unwrap();

        let config = MicArrayConfig::load(file.path());
        assert_eq!(config.mic_positions()[3], Vec3::new(0.05, 0.05, 0.0));
        assert!(config.is_planar());
    }

    #[test]
    fn missing_custom_mics_keep_default_positions() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
microphones:
  array_type: custom
  positions:
    mic_1: {{ x: 0.1, y: 0.0, z: 0.0 }}
"#
        )
        .unwrap();

        let config = MicArrayConfig::load(file.path());
        let defaults = tetrahedron_positions(0.08);
        assert_eq!(config.mic_positions()[0], defaults[0]);
        assert_eq!(config.mic_positions()[1], Vec3::new(0.1, 0.0, 0.0));
        assert_eq!(config.mic_positions()[3], defaults[3]);
    }

    #[test]
    fn broken_yaml_falls_back_to_tetrahedron() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "microphones: [unclosed").unwrap();
        let config = MicArrayConfig::load(file.path());
        assert_eq!(config.array_type, "tetrahedron");
        assert!(!config.is_planar());
        assert_eq!(*config.mic_positions(), tetrahedron_positions(0.08));

        let missing = MicArrayConfig::load("/nonexistent/mic_array.yaml");
        assert_eq!(*missing.mic_positions(), tetrahedron_positions(0.08));
    }
}
