//! Fixed-function light bookkeeping.
//!
//! Lights are keyed by an application-assigned index and may be sparse
//! (applications use arbitrarily large indices), so the map is an ordered
//! owned container rather than a dense array. The enabled flag is separate
//! from existence: disabling never deletes an entry.

use std::collections::BTreeMap;
use std::f32::consts::PI;

use glam::{Vec3, Vec4};
use opal_cmd::{DerivedLight, LightParams, LightType};
use tracing::warn;

use crate::error::DeviceError;

/// Concurrently active lights the software vertex pipeline evaluates.
/// Enabling more keeps the extra lights enabled but inactive until a slot
/// frees up.
pub const MAX_ACTIVE_LIGHTS: usize = 8;

#[derive(Clone, Debug)]
pub struct LightEntry {
    pub params: LightParams,
    pub derived: DerivedLight,
    pub enabled: bool,
}

#[derive(Clone, Debug, Default)]
pub struct LightMap {
    entries: BTreeMap<u32, LightEntry>,
    /// Indices currently evaluated, in activation order.
    active: Vec<u32>,
}

impl LightMap {
    pub fn get(&self, index: u32) -> Option<&LightEntry> {
        self.entries.get(&index)
    }

    pub fn is_enabled(&self, index: u32) -> bool {
        self.entries.get(&index).is_some_and(|e| e.enabled)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries, ordered by index.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &LightEntry)> {
        self.entries.iter().map(|(&i, e)| (i, e))
    }

    /// Lights the evaluator should consider, in activation order.
    pub fn active_lights(&self) -> impl Iterator<Item = &LightEntry> {
        self.active.iter().filter_map(|i| self.entries.get(i))
    }

    /// Stores or replaces the light at `index`, preserving its enabled
    /// state. Returns the derived parameters for command emission.
    pub fn set(&mut self, index: u32, params: LightParams) -> DerivedLight {
        let derived = derive_light(&params);
        let enabled = self.is_enabled(index);
        self.entries.insert(
            index,
            LightEntry {
                params,
                derived,
                enabled,
            },
        );
        derived
    }

    /// Flips the enabled flag. Enabling an index that was never set creates
    /// the default light first (matching legacy runtime behavior); the
    /// returned flag reports whether that happened so the caller can emit a
    /// `set-light` command for the implicit creation.
    pub fn set_enable(&mut self, index: u32, enable: bool) -> bool {
        let created = if !self.entries.contains_key(&index) {
            warn!(index, "enabling a light that was never set; using defaults");
            self.set(index, LightParams::default());
            true
        } else {
            false
        };

        let Some(entry) = self.entries.get_mut(&index) else {
            return created;
        };
        entry.enabled = enable;

        if enable {
            if !self.active.contains(&index) {
                if self.active.len() < MAX_ACTIVE_LIGHTS {
                    self.active.push(index);
                } else {
                    warn!(
                        index,
                        max = MAX_ACTIVE_LIGHTS,
                        "too many concurrently active lights; light stays inactive"
                    );
                }
            }
        } else {
            self.active.retain(|&i| i != index);
            // A previously crowded-out enabled light takes the freed slot.
            if self.active.len() < MAX_ACTIVE_LIGHTS {
                let candidate = self
                    .entries
                    .iter()
                    .find(|(i, e)| e.enabled && !self.active.contains(i))
                    .map(|(i, _)| *i);
                if let Some(i) = candidate {
                    self.active.push(i);
                }
            }
        }
        created
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.active.clear();
    }
}

/// Parameter validation performed before any state change.
pub fn validate_light(params: &LightParams) -> Result<(), DeviceError> {
    if params.range < 0.0 {
        return Err(DeviceError::InvalidLightParams("range must be non-negative"));
    }
    match params.light_type {
        LightType::Directional => {
            if params.direction == Vec3::ZERO {
                return Err(DeviceError::InvalidLightParams(
                    "directional light requires a direction",
                ));
            }
        }
        LightType::Spot => {
            if params.direction == Vec3::ZERO {
                return Err(DeviceError::InvalidLightParams(
                    "spot light requires a direction",
                ));
            }
            if params.theta < 0.0 || params.theta > params.phi || params.phi > PI {
                return Err(DeviceError::InvalidLightParams(
                    "spot cone angles must satisfy 0 <= theta <= phi <= pi",
                ));
            }
        }
        LightType::Point => {}
    }
    Ok(())
}

/// Computes the device-derived light constants.
///
/// The spot exponent bridges the D3D falloff model onto a GL-style
/// `cos^exponent` spot term. The approximation is deliberate; downstream
/// visual behavior depends on this exact formula.
pub fn derive_light(params: &LightParams) -> DerivedLight {
    match params.light_type {
        LightType::Directional => DerivedLight {
            position: Vec4::ZERO,
            direction: params.direction.normalize_or_zero().extend(0.0),
            exponent: 0.0,
            cutoff: 180.0,
        },
        LightType::Point => DerivedLight {
            position: params.position.extend(1.0),
            direction: Vec4::ZERO,
            exponent: 0.0,
            cutoff: 180.0,
        },
        LightType::Spot => {
            let mut rho = params.theta + (params.phi - params.theta) / 2.0;
            if rho < 1e-4 {
                rho = 1e-4;
            }
            // A degenerate cone rounds cos(rho/2) to 1.0 and would send the
            // quotient to -inf through ln(1) == 0.
            let cos_half_rho = (rho / 2.0).cos();
            let mut exponent = if cos_half_rho >= 1.0 {
                0.0
            } else {
                -0.3 / cos_half_rho.ln()
            };
            if exponent > 128.0 {
                exponent = 128.0;
            }
            DerivedLight {
                position: params.position.extend(1.0),
                direction: params.direction.normalize_or_zero().extend(0.0),
                exponent,
                cutoff: params.phi * 90.0 / PI,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_cmd::ColorRgba;

    fn spot(theta: f32, phi: f32) -> LightParams {
        LightParams {
            light_type: LightType::Spot,
            direction: Vec3::new(0.0, 0.0, 1.0),
            theta,
            phi,
            range: 100.0,
            ..Default::default()
        }
    }

    #[test]
    fn spot_exponent_matches_reference_formula() {
        let params = spot(0.4, 0.8);
        let derived = derive_light(&params);
        let rho: f32 = 0.4 + (0.8 - 0.4) / 2.0;
        let expected = -0.3 / (rho / 2.0).cos().ln();
        assert_eq!(derived.exponent, expected);
        assert_eq!(derived.cutoff, 0.8 * 90.0 / PI);
    }

    #[test]
    fn spot_exponent_clamps_at_128() {
        // A narrow cone drives log(cos) toward zero and the exponent sky-high.
        let derived = derive_light(&spot(0.0, 0.2));
        assert_eq!(derived.exponent, 128.0);
    }

    #[test]
    fn degenerate_spot_cone_does_not_divide_by_zero() {
        let derived = derive_light(&spot(0.0, 0.0));
        assert!(derived.exponent.is_finite());
    }

    #[test]
    fn point_and_directional_cutoff_is_180() {
        let p = LightParams {
            light_type: LightType::Point,
            position: Vec3::new(1.0, 2.0, 3.0),
            ..Default::default()
        };
        let d = derive_light(&p);
        assert_eq!(d.cutoff, 180.0);
        assert_eq!(d.position, Vec4::new(1.0, 2.0, 3.0, 1.0));

        let d = derive_light(&LightParams::default());
        assert_eq!(d.cutoff, 180.0);
        assert_eq!(d.direction, Vec4::new(0.0, 0.0, 1.0, 0.0));
    }

    #[test]
    fn disabling_does_not_delete_the_entry() {
        let mut lights = LightMap::default();
        lights.set(3, LightParams::default());
        lights.set_enable(3, true);
        lights.set_enable(3, false);
        assert!(lights.get(3).is_some());
        assert!(!lights.is_enabled(3));
        assert_eq!(lights.active_lights().count(), 0);
    }

    #[test]
    fn enabling_unset_light_creates_default() {
        let mut lights = LightMap::default();
        assert!(lights.set_enable(7, true));
        let entry = lights.get(7).unwrap();
        assert_eq!(entry.params.light_type, LightType::Directional);
        assert_eq!(entry.params.diffuse, ColorRgba::WHITE);
        assert!(entry.enabled);
    }

    #[test]
    fn activation_overflow_defers_until_slot_frees() {
        let mut lights = LightMap::default();
        for i in 0..=MAX_ACTIVE_LIGHTS as u32 {
            lights.set(i, LightParams::default());
            lights.set_enable(i, true);
        }
        // The last light is enabled but crowded out.
        assert!(lights.is_enabled(MAX_ACTIVE_LIGHTS as u32));
        assert_eq!(lights.active_lights().count(), MAX_ACTIVE_LIGHTS);

        // Disabling an active light hands its slot to the crowded-out one.
        lights.set_enable(0, false);
        assert!(!lights.is_enabled(0));
        assert_eq!(lights.active_lights().count(), MAX_ACTIVE_LIGHTS);
    }

    #[test]
    fn validate_rejects_bad_spot_cone() {
        assert!(validate_light(&spot(1.0, 0.5)).is_err());
        assert!(validate_light(&spot(0.2, 0.5)).is_ok());
        let mut p = LightParams::default();
        p.range = -1.0;
        assert!(validate_light(&p).is_err());
    }
}
