//! Shoebox room impulse-response generator
//!
//! Image-source reflections up to a configurable order inside a rectangular
//! room with per-wall reflection loss, plus an exponentially decaying
//! diffuse tail beyond the modeled reflections. The output is a mono IR
//! ready for the convolution engine's `update_response_td`.

use ef_core::{EfError, EfResult, Sample};
use rand::prelude::*;
use serde::{Deserialize, Serialize};

/// Speed of sound in air, m/s
const SPEED_OF_SOUND: f32 = 343.0;

/// Simple 3-vector in meters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    fn distance(&self, other: &Vec3) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Rectangular room: dimensions in meters, per-wall absorption in `[0, 1]`
/// ordered `[-x, +x, -y, +y, -z, +z]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Room {
    pub size: Vec3,
    pub absorption: [f32; 6],
}

impl Room {
    pub fn new(size: Vec3, absorption: [f32; 6]) -> Self {
        Self { size, absorption }
    }

    /// A moderately damped room of the given dimensions.
    pub fn damped(size: Vec3) -> Self {
        Self {
            size,
            absorption: [0.3; 6],
        }
    }

    fn contains(&self, p: &Vec3) -> bool {
        p.x >= 0.0
            && p.y >= 0.0
            && p.z >= 0.0
            && p.x <= self.size.x
            && p.y <= self.size.y
            && p.z <= self.size.z
    }
}

/// Image-source room response generator.
pub struct RoomGenerator {
    sample_rate: f32,
    /// Highest image order per axis
    max_order: i32,
    /// Diffuse tail level relative to the last reflections; 0 disables it
    tail_level: f32,
}

impl RoomGenerator {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            sample_rate,
            max_order: 8,
            tail_level: 0.05,
        }
    }

    pub fn with_max_order(mut self, order: i32) -> Self {
        self.max_order = order.max(0);
        self
    }

    pub fn with_tail_level(mut self, level: f32) -> Self {
        self.tail_level = level.max(0.0);
        self
    }

    /// Generate a mono response of `ir_len` samples for a source and
    /// listener inside `room`.
    pub fn generate(
        &self,
        room: &Room,
        source: Vec3,
        listener: Vec3,
        ir_len: usize,
    ) -> EfResult<Vec<Sample>> {
        if ir_len == 0 {
            return Err(EfError::InvalidArg("zero-length response".into()));
        }
        if !room.contains(&source) || !room.contains(&listener) {
            return Err(EfError::InvalidArg(
                "source and listener must lie inside the room".into(),
            ));
        }
        for a in room.absorption {
            if !(0.0..=1.0).contains(&a) {
                return Err(EfError::InvalidArg(format!("absorption {a} outside [0, 1]")));
            }
        }

        let mut ir = vec![0.0; ir_len];
        let mut images = 0usize;
        let refl = [
            1.0 - room.absorption[0],
            1.0 - room.absorption[1],
            1.0 - room.absorption[2],
            1.0 - room.absorption[3],
            1.0 - room.absorption[4],
            1.0 - room.absorption[5],
        ];
        let order = self.max_order;
        let mut latest_reflection = 0usize;

        for nx in -order..=order {
            for ny in -order..=order {
                for nz in -order..=order {
                    // Mirrored source position on each axis
                    let ix = image_coord(source.x, room.size.x, nx);
                    let iy = image_coord(source.y, room.size.y, ny);
                    let iz = image_coord(source.z, room.size.z, nz);
                    let image = Vec3::new(ix, iy, iz);

                    let dist = image.distance(&listener).max(1e-3);
                    let delay = (dist / SPEED_OF_SOUND * self.sample_rate).round() as usize;
                    if delay >= ir_len {
                        continue;
                    }

                    // One wall hit per axis fold
                    let gain = axis_gain(nx, refl[0], refl[1])
                        * axis_gain(ny, refl[2], refl[3])
                        * axis_gain(nz, refl[4], refl[5])
                        / dist;

                    ir[delay] += gain;
                    images += 1;
                    latest_reflection = latest_reflection.max(delay);
                }
            }
        }
        log::debug!("room response: {images} image sources within {ir_len} samples");

        if self.tail_level > 0.0 && latest_reflection + 1 < ir_len {
            self.add_diffuse_tail(&mut ir, latest_reflection, room);
        }
        Ok(ir)
    }

    /// Generate a left/right response pair for a listener head centered at
    /// `listener`, ears displaced by `half_head` along opposite directions.
    ///
    /// Both ears must stay inside the room; the caller picks the ear axis
    /// from the head orientation.
    pub fn generate_stereo(
        &self,
        room: &Room,
        source: Vec3,
        listener: Vec3,
        half_head: Vec3,
        ir_len: usize,
    ) -> EfResult<(Vec<Sample>, Vec<Sample>)> {
        let left_ear = Vec3::new(
            listener.x - half_head.x,
            listener.y - half_head.y,
            listener.z - half_head.z,
        );
        let right_ear = Vec3::new(
            listener.x + half_head.x,
            listener.y + half_head.y,
            listener.z + half_head.z,
        );
        let left = self.generate(room, source, left_ear, ir_len)?;
        let right = self.generate(room, source, right_ear, ir_len)?;
        Ok((left, right))
    }

    /// Exponential noise tail beyond the modeled reflections, RT60 derived
    /// from the mean absorption (Sabine estimate).
    fn add_diffuse_tail(&self, ir: &mut [Sample], from: usize, room: &Room) {
        let mean_abs: f32 = room.absorption.iter().sum::<f32>() / 6.0;
        let volume = room.size.x * room.size.y * room.size.z;
        let surface = 2.0
            * (room.size.x * room.size.y + room.size.y * room.size.z + room.size.x * room.size.z);
        let rt60 = (0.161 * volume / (mean_abs * surface).max(1e-3)).max(0.05);
        let decay = (-6.91 / (rt60 * self.sample_rate)).exp();

        // Deterministic seed so regenerating a room reproduces its tail
        let mut rng = StdRng::seed_from_u64(0x5eed_0f00d);
        let mut level = self.tail_level;
        for sample in ir.iter_mut().skip(from + 1) {
            *sample += level * (rng.random::<f32>() * 2.0 - 1.0);
            level *= decay;
        }
    }
}

/// Mirrored coordinate of the n-th image along one axis: even folds keep
/// the source offset, odd folds reflect it.
fn image_coord(p: f32, size: f32, n: i32) -> f32 {
    if n % 2 == 0 {
        n as f32 * size + p
    } else {
        n as f32 * size + (size - p)
    }
}

/// Reflection loss accumulated by |n| wall hits along one axis, split
/// between the two opposing walls.
fn axis_gain(n: i32, lo: f32, hi: f32) -> f32 {
    let hits = n.unsigned_abs();
    let lo_hits = hits / 2 + if n < 0 { hits % 2 } else { 0 };
    let hi_hits = hits - lo_hits;
    lo.powi(lo_hits as i32) * hi.powi(hi_hits as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_room() -> Room {
        Room::damped(Vec3::new(6.0, 3.0, 4.0))
    }

    #[test]
    fn test_direct_path_arrival() {
        let generator = RoomGenerator::new(48000.0).with_tail_level(0.0);
        let source = Vec3::new(1.0, 1.5, 2.0);
        let listener = Vec3::new(4.43, 1.5, 2.0);
        let ir = generator
            .generate(&test_room(), source, listener, 48000)
            .unwrap();

        // Direct distance 3.43 m -> 10 ms -> sample 480
        let delay = (3.43f32 / 343.0 * 48000.0).round() as usize;
        assert!(ir[delay].abs() > 0.0, "no direct arrival at sample {delay}");
        for &s in &ir[..delay] {
            assert_eq!(s, 0.0, "energy before the direct path");
        }
    }

    #[test]
    fn test_absorption_reduces_energy() {
        let generator = RoomGenerator::new(48000.0).with_tail_level(0.0);
        let source = Vec3::new(1.0, 1.0, 1.0);
        let listener = Vec3::new(5.0, 2.0, 3.0);

        let live = Room::new(Vec3::new(6.0, 3.0, 4.0), [0.1; 6]);
        let dead = Room::new(Vec3::new(6.0, 3.0, 4.0), [0.8; 6]);

        let energy = |ir: &[f32]| ir.iter().map(|s| s * s).sum::<f32>();
        let e_live = energy(&generator.generate(&live, source, listener, 24000).unwrap());
        let e_dead = energy(&generator.generate(&dead, source, listener, 24000).unwrap());
        assert!(e_live > e_dead, "{e_live} <= {e_dead}");
    }

    #[test]
    fn test_outside_positions_rejected() {
        let generator = RoomGenerator::new(48000.0);
        let room = test_room();
        assert!(
            generator
                .generate(&room, Vec3::new(-1.0, 1.0, 1.0), Vec3::new(1.0, 1.0, 1.0), 1024)
                .is_err()
        );
        assert!(
            generator
                .generate(&room, Vec3::new(1.0, 1.0, 1.0), Vec3::new(1.0, 9.0, 1.0), 1024)
                .is_err()
        );
    }

    #[test]
    fn test_stereo_interaural_delay() {
        let generator = RoomGenerator::new(48000.0).with_tail_level(0.0).with_max_order(0);
        let room = test_room();
        // Source to the listener's right: the right ear hears it earlier
        let source = Vec3::new(5.0, 1.5, 2.0);
        let listener = Vec3::new(2.0, 1.5, 2.0);
        let (left, right) = generator
            .generate_stereo(&room, source, listener, Vec3::new(0.09, 0.0, 0.0), 4800)
            .unwrap();

        let first = |ir: &[f32]| ir.iter().position(|&s| s != 0.0).unwrap();
        assert!(first(&right) < first(&left));
    }

    #[test]
    fn test_tail_is_reproducible() {
        let generator = RoomGenerator::new(48000.0);
        let source = Vec3::new(2.0, 1.0, 2.0);
        let listener = Vec3::new(4.0, 2.0, 1.0);
        let a = generator.generate(&test_room(), source, listener, 8192).unwrap();
        let b = generator.generate(&test_room(), source, listener, 8192).unwrap();
        assert_eq!(a, b);
    }
}
