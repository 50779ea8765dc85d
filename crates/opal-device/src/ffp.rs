//! Software fixed-function vertex pipeline.
//!
//! A pure function of a frozen [`State`]: transform, legacy vertex lighting
//! and vertex fog, evaluated per the MSDN fixed-function formulas. No shared
//! mutable state across vertices, so callers may shard the input freely.

use glam::{Mat4, Vec3, Vec4};
use opal_cmd::{ColorRgba, LightType, RenderState, TransformState, Viewport};

use crate::device::DeviceCaps;
use crate::light::LightEntry;
use crate::state::{
    State, FOG_EXP, FOG_EXP2, FOG_LINEAR, FOG_NONE, MAX_TEXTURE_STAGES, MCS_COLOR1, MCS_COLOR2,
};

/// Per-process evaluator configuration. Explicit rather than a hidden
/// static so tests can run in isolation.
#[derive(Clone, Copy, Debug, Default)]
pub struct FfpConfig {
    /// Selects the legacy `(range - d) / range` attenuation model instead
    /// of the standard reciprocal form.
    pub legacy_lighting: bool,
}

/// Untransformed input vertex. Optional attributes mirror the flexibility
/// of vertex declarations; a missing attribute falls back the same way the
/// legacy pipeline does.
#[derive(Clone, Copy, Debug)]
pub struct FfpVertex {
    pub position: Vec3,
    pub normal: Option<Vec3>,
    pub diffuse: Option<ColorRgba>,
    pub specular: Option<ColorRgba>,
    /// Per-stage texture coordinates, padded to four components.
    pub texcoords: [Option<Vec4>; MAX_TEXTURE_STAGES],
}

impl FfpVertex {
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            normal: None,
            diffuse: None,
            specular: None,
            texcoords: [None; MAX_TEXTURE_STAGES],
        }
    }
}

/// Screen-space output vertex.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProcessedVertex {
    /// Viewport-mapped position; z lies in `[min_z, max_z]`.
    pub position: Vec3,
    /// Reciprocal homogeneous w.
    pub rhw: f32,
    pub diffuse: ColorRgba,
    /// When vertex fog is active the alpha channel carries the fog factor
    /// (legacy fog-via-specular-alpha; deliberate channel reuse).
    pub specular: ColorRgba,
    /// Set when clipping is enabled and the vertex falls outside the clip
    /// volume.
    pub clipped: bool,
    /// Texture coordinates, passed through untouched.
    pub texcoords: [Option<Vec4>; MAX_TEXTURE_STAGES],
}

/// Transforms, lights and fogs `inputs` against the frozen state snapshot.
pub fn process_vertices(
    state: &State,
    caps: &DeviceCaps,
    config: FfpConfig,
    inputs: &[FfpVertex],
) -> Vec<ProcessedVertex> {
    let eval = Evaluator::new(state, caps, config);
    inputs.iter().map(|v| eval.run(v)).collect()
}

/// Per-call precomputed matrices and mode switches.
struct Evaluator<'a> {
    state: &'a State,
    config: FfpConfig,
    view: Mat4,
    modelview: Mat4,
    clip_from_model: Mat4,
    normal_matrix: Mat4,
    viewport: Viewport,
    lights: Vec<&'a LightEntry>,
    lighting: bool,
    specular_enable: bool,
    local_viewer: bool,
    normalize_normals: bool,
    color_vertex: bool,
    clipping: bool,
}

impl<'a> Evaluator<'a> {
    fn new(state: &'a State, caps: &DeviceCaps, config: FfpConfig) -> Self {
        let world = state.transforms[TransformState::World(0)
            .index()
            .unwrap_or_default()];
        let view = state.transforms[TransformState::View.index().unwrap_or_default()];
        let projection = state.transforms[TransformState::Projection
            .index()
            .unwrap_or_default()];
        let modelview = view * world;
        Self {
            state,
            config,
            view,
            modelview,
            clip_from_model: projection * modelview,
            normal_matrix: modelview.inverse().transpose(),
            viewport: state.viewports[0],
            lights: state
                .lights
                .active_lights()
                .take(caps.max_ffp_lights as usize)
                .collect(),
            lighting: state.render_state_bool(RenderState::Lighting),
            specular_enable: state.render_state_bool(RenderState::SpecularEnable),
            local_viewer: state.render_state_bool(RenderState::LocalViewer),
            normalize_normals: state.render_state_bool(RenderState::NormalizeNormals),
            color_vertex: state.render_state_bool(RenderState::ColorVertex),
            clipping: state.render_state_bool(RenderState::Clipping),
        }
    }

    fn run(&self, input: &FfpVertex) -> ProcessedVertex {
        let model_pos = input.position.extend(1.0);
        let view_pos = (self.modelview * model_pos).truncate();
        let clip = self.clip_from_model * model_pos;

        let (position, rhw) = viewport_map(clip, &self.viewport);
        let clipped = self.clipping && outside_clip_volume(clip);

        let (diffuse, mut specular) = if self.lighting {
            self.light(input, view_pos)
        } else {
            // Lighting off: colors pass through; a vertex without a diffuse
            // attribute renders opaque white.
            (
                input.diffuse.unwrap_or(ColorRgba::WHITE),
                input.specular.unwrap_or(ColorRgba::TRANSPARENT),
            )
        };

        if self.state.render_state_bool(RenderState::FogEnable) {
            specular.a = self.fog_factor(view_pos);
        }

        ProcessedVertex {
            position,
            rhw,
            diffuse,
            specular,
            clipped,
            texcoords: input.texcoords,
        }
    }

    /// Material color source selection: COLORVERTEX gates the per-vertex
    /// sources, and a selected vertex color that is absent falls back to the
    /// material color.
    fn material_color(&self, source: RenderState, input: &FfpVertex, material: ColorRgba) -> ColorRgba {
        if !self.color_vertex {
            return material;
        }
        match self.state.render_state(source) {
            MCS_COLOR1 => input.diffuse.unwrap_or(material),
            MCS_COLOR2 => input.specular.unwrap_or(material),
            _ => material,
        }
    }

    fn light(&self, input: &FfpVertex, view_pos: Vec3) -> (ColorRgba, ColorRgba) {
        let material = &self.state.material;
        let diffuse_material =
            self.material_color(RenderState::DiffuseMaterialSource, input, material.diffuse);
        let ambient_material =
            self.material_color(RenderState::AmbientMaterialSource, input, material.ambient);
        let specular_material = self.material_color(
            RenderState::SpecularMaterialSource,
            input,
            material.specular,
        );
        let emissive_material = self.material_color(
            RenderState::EmissiveMaterialSource,
            input,
            material.emissive,
        );

        let normal = input.normal.map(|n| {
            let n = (self.normal_matrix * n.extend(0.0)).truncate();
            if self.normalize_normals {
                n.normalize_or_zero()
            } else {
                n
            }
        });

        let mut ambient_accum: Vec3 =
            ColorRgba::from_argb(self.state.render_state(RenderState::Ambient)).into();
        let mut diffuse_accum = Vec3::ZERO;
        let mut specular_accum = Vec3::ZERO;

        for entry in &self.lights {
            let contribution = self.light_contribution(entry, view_pos);
            let Some(c) = contribution else { continue };

            ambient_accum += Vec3::from(entry.params.ambient) * c.strength;

            // Without a normal only the ambient sums apply.
            let Some(normal) = normal else { continue };
            let n_dot_l = normal.dot(c.to_light);
            if n_dot_l <= 0.0 {
                continue;
            }
            diffuse_accum += Vec3::from(entry.params.diffuse) * n_dot_l * c.strength;

            if self.specular_enable {
                let to_viewer = if self.local_viewer {
                    (-view_pos).normalize_or_zero()
                } else {
                    // Infinite viewer along the view axis.
                    Vec3::new(0.0, 0.0, -1.0)
                };
                let halfway = (c.to_light + to_viewer).normalize_or_zero();
                let n_dot_h = normal.dot(halfway);
                if n_dot_h > 0.0 {
                    specular_accum += Vec3::from(entry.params.specular)
                        * n_dot_h.powf(self.state.material.power)
                        * c.strength;
                }
            }
        }

        let diffuse_rgb = Vec3::from(emissive_material)
            + Vec3::from(ambient_material) * ambient_accum
            + Vec3::from(diffuse_material) * diffuse_accum;
        let specular_rgb = Vec3::from(specular_material) * specular_accum;

        (
            ColorRgba::new(diffuse_rgb.x, diffuse_rgb.y, diffuse_rgb.z, diffuse_material.a),
            ColorRgba::new(specular_rgb.x, specular_rgb.y, specular_rgb.z, specular_material.a),
        )
    }

    /// Attenuated, cone-weighted strength of one light and the normalized
    /// vertex-to-light vector, or `None` when the light contributes nothing.
    fn light_contribution(&self, entry: &LightEntry, view_pos: Vec3) -> Option<LightSample> {
        let params = &entry.params;
        match params.light_type {
            LightType::Directional => {
                let dir = (self.view * entry.derived.direction).truncate();
                Some(LightSample {
                    to_light: (-dir).normalize_or_zero(),
                    strength: 1.0,
                })
            }
            LightType::Point | LightType::Spot => {
                let light_pos = (self.view * entry.derived.position).truncate();
                let to_light = light_pos - view_pos;
                let distance = to_light.length();
                let [c, l, q] = params.attenuation;

                let attenuation = if self.config.legacy_lighting {
                    // Legacy falloff: linear factor with its square as the
                    // quadratic term.
                    let t = if params.range > 0.0 {
                        ((params.range - distance) / params.range).max(0.0)
                    } else {
                        0.0
                    };
                    c + l * t + q * t * t
                } else {
                    if distance > params.range {
                        return None;
                    }
                    let denom = c + l * distance + q * distance * distance;
                    if denom != 0.0 {
                        1.0 / denom
                    } else {
                        1.0
                    }
                };

                let to_light = to_light.normalize_or_zero();
                let strength = match params.light_type {
                    LightType::Spot => {
                        let spot_dir = (self.view * entry.derived.direction)
                            .truncate()
                            .normalize_or_zero();
                        // Cone angle between the light axis and the vertex.
                        let cos_angle = spot_dir.dot(-to_light);
                        attenuation * spot_factor(params.theta, params.phi, params.falloff, cos_angle)
                    }
                    _ => attenuation,
                };
                Some(LightSample { to_light, strength })
            }
        }
    }

    fn fog_factor(&self, view_pos: Vec3) -> f32 {
        let coord = if self.state.render_state_bool(RenderState::RangeFogEnable) {
            view_pos.length()
        } else {
            view_pos.z.abs()
        };
        let mode = match self.state.render_state(RenderState::FogVertexMode) {
            FOG_NONE => self.state.render_state(RenderState::FogTableMode),
            mode => mode,
        };
        let density = self.state.render_state_f32(RenderState::FogDensity);
        match mode {
            FOG_LINEAR => {
                let start = self.state.render_state_f32(RenderState::FogStart);
                let end = self.state.render_state_f32(RenderState::FogEnd);
                if end == start {
                    0.0
                } else {
                    // Deliberately unclamped; downstream saturates.
                    (end - coord) / (end - start)
                }
            }
            FOG_EXP => (-coord * density).exp(),
            FOG_EXP2 => {
                let e = coord * density;
                (-(e * e)).exp()
            }
            _ => 1.0,
        }
    }
}

struct LightSample {
    /// Normalized vertex-to-light vector in view space.
    to_light: Vec3,
    strength: f32,
}

/// D3D spot cone weight. A falloff of exactly zero short-circuits to full
/// intensity, sidestepping the ill-defined `pow(x, 0)` edge at the cone
/// boundary.
fn spot_factor(theta: f32, phi: f32, falloff: f32, cos_angle: f32) -> f32 {
    let cos_half_theta = (theta / 2.0).cos();
    let cos_half_phi = (phi / 2.0).cos();
    if cos_angle >= cos_half_theta {
        return 1.0;
    }
    if cos_angle <= cos_half_phi {
        return 0.0;
    }
    if falloff == 0.0 {
        return 1.0;
    }
    ((cos_angle - cos_half_phi) / (cos_half_theta - cos_half_phi)).powf(falloff)
}

/// Homogeneous divide plus viewport mapping (y flipped, z scaled into the
/// viewport depth range).
fn viewport_map(clip: Vec4, viewport: &Viewport) -> (Vec3, f32) {
    if clip.w == 0.0 {
        return (Vec3::new(clip.x, clip.y, clip.z), 1.0);
    }
    let rhw = 1.0 / clip.w;
    let ndc_x = clip.x * rhw;
    let ndc_y = clip.y * rhw;
    let ndc_z = clip.z * rhw;
    let x = (ndc_x + 1.0) * 0.5 * viewport.width + viewport.x;
    let y = viewport.y + viewport.height * (1.0 - (ndc_y + 1.0) * 0.5);
    let z = viewport.min_z + ndc_z * (viewport.max_z - viewport.min_z);
    (Vec3::new(x, y, z), rhw)
}

/// D3D clip volume: -w <= x,y <= w, 0 <= z <= w.
fn outside_clip_volume(clip: Vec4) -> bool {
    clip.x.abs() > clip.w || clip.y.abs() > clip.w || clip.z < 0.0 || clip.z > clip.w
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_cmd::{LightParams, Material};

    use crate::device::{DeviceCaps, FeatureLevel};

    fn caps() -> DeviceCaps {
        DeviceCaps {
            feature_level: FeatureLevel::Level11_0,
            max_render_targets: 8,
            max_clip_planes: 8,
            max_ffp_lights: 8,
        }
    }

    fn lit_state(light: LightParams) -> State {
        let mut state = State::default();
        state.viewports[0] = Viewport {
            x: 0.0,
            y: 0.0,
            width: 640.0,
            height: 480.0,
            min_z: 0.0,
            max_z: 1.0,
        };
        state.material = Material {
            diffuse: ColorRgba::WHITE,
            ambient: ColorRgba::TRANSPARENT,
            specular: ColorRgba::TRANSPARENT,
            emissive: ColorRgba::TRANSPARENT,
            power: 0.0,
        };
        // Vertex color sources would override the material in this setup.
        state.render_states[RenderState::ColorVertex as usize] = 0;
        state.lights.set(0, light);
        state.lights.set_enable(0, true);
        state
    }

    #[test]
    fn directional_light_full_n_dot_l() {
        let state = lit_state(LightParams {
            light_type: LightType::Directional,
            diffuse: ColorRgba::WHITE,
            ambient: ColorRgba::TRANSPARENT,
            specular: ColorRgba::TRANSPARENT,
            direction: Vec3::new(0.0, 0.0, -1.0),
            ..Default::default()
        });

        let vertex = FfpVertex {
            normal: Some(Vec3::new(0.0, 0.0, 1.0)),
            ..FfpVertex::at(Vec3::ZERO)
        };
        let out = process_vertices(&state, &caps(), FfpConfig::default(), &[vertex]);
        assert_eq!(out[0].diffuse.r, 1.0);
        assert_eq!(out[0].diffuse.g, 1.0);
        assert_eq!(out[0].diffuse.b, 1.0);
    }

    #[test]
    fn directional_ambient_applies_without_normal() {
        let mut state = lit_state(LightParams {
            light_type: LightType::Directional,
            diffuse: ColorRgba::WHITE,
            ambient: ColorRgba::WHITE,
            direction: Vec3::new(0.0, 0.0, -1.0),
            ..Default::default()
        });
        state.material.ambient = ColorRgba::WHITE;

        let out = process_vertices(
            &state,
            &caps(),
            FfpConfig::default(),
            &[FfpVertex::at(Vec3::ZERO)],
        );
        // Ambient contributes, diffuse/specular need a normal.
        assert_eq!(out[0].diffuse.r, 1.0);
    }

    #[test]
    fn lighting_off_passes_vertex_colors_through() {
        let mut state = State::default();
        state.render_states[RenderState::Lighting as usize] = 0;
        let colored = FfpVertex {
            diffuse: Some(ColorRgba::new(0.25, 0.5, 0.75, 1.0)),
            ..FfpVertex::at(Vec3::ZERO)
        };
        let out = process_vertices(
            &state,
            &caps(),
            FfpConfig::default(),
            &[colored, FfpVertex::at(Vec3::ZERO)],
        );
        assert_eq!(out[0].diffuse, ColorRgba::new(0.25, 0.5, 0.75, 1.0));
        // No diffuse attribute renders opaque white.
        assert_eq!(out[1].diffuse, ColorRgba::WHITE);
    }

    #[test]
    fn linear_fog_boundaries_are_unclamped() {
        let mut state = State::default();
        state.render_states[RenderState::FogEnable as usize] = 1;
        state.render_states[RenderState::FogVertexMode as usize] = FOG_LINEAR;
        state.render_states[RenderState::FogStart as usize] = 0f32.to_bits();
        state.render_states[RenderState::FogEnd as usize] = 10f32.to_bits();
        state.render_states[RenderState::Lighting as usize] = 0;

        let at = |z: f32| FfpVertex::at(Vec3::new(0.0, 0.0, z));
        let out = process_vertices(
            &state,
            &caps(),
            FfpConfig::default(),
            &[at(10.0), at(0.0), at(20.0)],
        );
        assert_eq!(out[0].specular.a, 0.0);
        assert_eq!(out[1].specular.a, 1.0);
        assert_eq!(out[2].specular.a, -1.0);
    }

    #[test]
    fn attenuation_modes_differ() {
        let light = LightParams {
            light_type: LightType::Point,
            diffuse: ColorRgba::WHITE,
            position: Vec3::new(0.0, 0.0, 5.0),
            range: 10.0,
            attenuation: [0.0, 1.0, 0.0],
            ..Default::default()
        };
        let state = lit_state(light);
        let vertex = FfpVertex {
            normal: Some(Vec3::new(0.0, 0.0, 1.0)),
            ..FfpVertex::at(Vec3::ZERO)
        };

        // Standard mode: 1 / (l * d) with d = 5.
        let out = process_vertices(&state, &caps(), FfpConfig::default(), &[vertex]);
        assert!((out[0].diffuse.r - 0.2).abs() < 1e-6);

        // Legacy mode: l * (range - d) / range = 0.5.
        let legacy = FfpConfig {
            legacy_lighting: true,
        };
        let out = process_vertices(&state, &caps(), legacy, &[vertex]);
        assert!((out[0].diffuse.r - 0.5).abs() < 1e-6);
    }

    #[test]
    fn out_of_range_light_contributes_nothing_in_standard_mode() {
        let light = LightParams {
            light_type: LightType::Point,
            diffuse: ColorRgba::WHITE,
            position: Vec3::new(0.0, 0.0, 50.0),
            range: 10.0,
            attenuation: [1.0, 0.0, 0.0],
            ..Default::default()
        };
        let state = lit_state(light);
        let vertex = FfpVertex {
            normal: Some(Vec3::new(0.0, 0.0, 1.0)),
            ..FfpVertex::at(Vec3::ZERO)
        };
        let out = process_vertices(&state, &caps(), FfpConfig::default(), &[vertex]);
        assert_eq!(out[0].diffuse.r, 0.0);
    }

    #[test]
    fn spot_cone_factor_edges() {
        // Inside the inner cone.
        assert_eq!(spot_factor(1.0, 2.0, 2.0, 1.0), 1.0);
        // Outside the outer cone.
        assert_eq!(spot_factor(1.0, 2.0, 2.0, 0.0), 0.0);
        // Falloff of zero short-circuits in the transition band.
        let mid = ((1.0f32 / 2.0).cos() + (2.0f32 / 2.0).cos()) / 2.0;
        assert_eq!(spot_factor(1.0, 2.0, 0.0, mid), 1.0);
        // Transition band interpolates strictly between the edges.
        let f = spot_factor(1.0, 2.0, 1.0, mid);
        assert!(f > 0.0 && f < 1.0);
    }

    #[test]
    fn texture_coordinates_pass_through_untouched() {
        let mut state = State::default();
        state.render_states[RenderState::Lighting as usize] = 0;
        let mut vertex = FfpVertex::at(Vec3::new(0.25, -0.5, 0.5));
        vertex.texcoords[0] = Some(Vec4::new(0.25, 0.75, 0.0, 1.0));
        vertex.texcoords[3] = Some(Vec4::new(-2.0, 3.0, 0.5, 1.0));

        let out = process_vertices(&state, &caps(), FfpConfig::default(), &[vertex]);
        assert_eq!(out[0].texcoords, vertex.texcoords);
        assert!(out[0].texcoords[1].is_none());

        // Lighting and fog leave the coordinates alone.
        let mut lit = lit_state(LightParams::default());
        lit.render_states[RenderState::FogEnable as usize] = 1;
        let out = process_vertices(&lit, &caps(), FfpConfig::default(), &[vertex]);
        assert_eq!(out[0].texcoords, vertex.texcoords);
    }

    #[test]
    fn viewport_mapping_flips_y_and_scales_depth() {
        let viewport = Viewport {
            x: 0.0,
            y: 0.0,
            width: 640.0,
            height: 480.0,
            min_z: 0.0,
            max_z: 1.0,
        };
        // NDC origin maps to the viewport center.
        let (p, rhw) = viewport_map(Vec4::new(0.0, 0.0, 0.5, 1.0), &viewport);
        assert_eq!(p, Vec3::new(320.0, 240.0, 0.5));
        assert_eq!(rhw, 1.0);
        // +y in NDC is up, screen y grows down.
        let (p, _) = viewport_map(Vec4::new(0.0, 1.0, 0.0, 1.0), &viewport);
        assert_eq!(p.y, 0.0);
        let (p, rhw) = viewport_map(Vec4::new(2.0, 0.0, 1.0, 2.0), &viewport);
        assert_eq!(p.x, 640.0);
        assert_eq!(rhw, 0.5);
    }

    #[test]
    fn clip_flag_respects_clipping_render_state() {
        let mut state = State::default();
        state.render_states[RenderState::Lighting as usize] = 0;
        // Identity transforms: clip space == model space, w == 1.
        let outside = FfpVertex::at(Vec3::new(5.0, 0.0, 0.5));
        let inside = FfpVertex::at(Vec3::new(0.0, 0.0, 0.5));
        let out = process_vertices(&state, &caps(), FfpConfig::default(), &[outside, inside]);
        assert!(out[0].clipped);
        assert!(!out[1].clipped);

        state.render_states[RenderState::Clipping as usize] = 0;
        let out = process_vertices(&state, &caps(), FfpConfig::default(), &[outside]);
        assert!(!out[0].clipped);
    }
}
