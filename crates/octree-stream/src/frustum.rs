//! View frustums, LOD parameters and element prioritisation.

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::config::StreamConfig;

/// Priority assigned when there is no view to judge relevance by, and to
/// known elements that changed since they were last sent.
pub const WHEN_IN_DOUBT_PRIORITY: f32 = 1.0;

/// Smallest angular size (radians) sent at the default LOD.
pub const BASE_MIN_ANGULAR_SIZE: f32 = 0.001;
pub const DEFAULT_OCTREE_SIZE_SCALE: f32 = 1.0;
/// Extra boundary levels applied while the view is moving.
pub const LOW_RES_MOVING_ADJUST: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewFrustum {
    pub position: Vec3,
    pub orientation: Quat,
    /// Vertical field of view, radians.
    pub field_of_view: f32,
    pub aspect_ratio: f32,
    pub near_clip: f32,
    pub far_clip: f32,
    /// Radius of the sphere around the viewer that is always in view.
    pub center_radius: f32,
}

impl Default for ViewFrustum {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            field_of_view: 45f32.to_radians(),
            aspect_ratio: 16.0 / 9.0,
            near_clip: 0.1,
            far_clip: 1_000.0,
            center_radius: 3.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrustumTolerance {
    pub position: f32,
    pub orientation_radians: f32,
    pub fov_radians: f32,
}

impl FrustumTolerance {
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            position: config.position_epsilon,
            orientation_radians: config.orientation_epsilon_degrees.to_radians(),
            fov_radians: config.fov_epsilon_degrees.to_radians(),
        }
    }
}

impl Default for FrustumTolerance {
    fn default() -> Self {
        Self::from_config(&StreamConfig::default())
    }
}

/// How a bounding sphere sits relative to a frustum.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Sighting {
    distance: f32,
    /// Cosine of the angle between the view axis and the sphere centre.
    off_axis_cos: f32,
}

impl ViewFrustum {
    pub fn direction(&self) -> Vec3 {
        self.orientation * Vec3::NEG_Z
    }

    pub fn is_similar(&self, other: &ViewFrustum, tolerance: &FrustumTolerance) -> bool {
        self.position.distance(other.position) <= tolerance.position
            && self.orientation.angle_between(other.orientation) <= tolerance.orientation_radians
            && (self.field_of_view - other.field_of_view).abs() <= tolerance.fov_radians
            && (self.aspect_ratio - other.aspect_ratio).abs() <= 0.01
            && (self.near_clip - other.near_clip).abs() <= tolerance.position
            && (self.far_clip - other.far_clip).abs() <= tolerance.position
    }

    /// Half angle of the cone that encloses the rectangular frustum.
    fn enclosing_half_angle(&self) -> f32 {
        let tan_half_v = (self.field_of_view * 0.5).tan();
        (tan_half_v * (1.0 + self.aspect_ratio * self.aspect_ratio).sqrt()).atan()
    }

    fn sight(&self, center: Vec3, radius: f32) -> Option<Sighting> {
        let offset = center - self.position;
        let distance = offset.length();
        if distance <= self.center_radius + radius {
            return Some(Sighting {
                distance,
                off_axis_cos: 1.0,
            });
        }
        let along = offset.dot(self.direction());
        if along + radius < self.near_clip || along - radius > self.far_clip {
            return None;
        }
        let off_axis_cos = (along / distance).clamp(-1.0, 1.0);
        let off_axis = off_axis_cos.acos();
        let angular_radius = (radius / distance).min(1.0).asin();
        if off_axis - angular_radius > self.enclosing_half_angle() {
            return None;
        }
        Some(Sighting {
            distance,
            off_axis_cos,
        })
    }

    pub fn sphere_in_view(&self, center: Vec3, radius: f32) -> bool {
        self.sight(center, radius).is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LodParams {
    pub octree_size_scale: f32,
    pub boundary_level_adjust: i32,
}

impl Default for LodParams {
    fn default() -> Self {
        Self {
            octree_size_scale: DEFAULT_OCTREE_SIZE_SCALE,
            boundary_level_adjust: 0,
        }
    }
}

impl LodParams {
    /// Smallest angular size that is still worth sending. Each boundary level
    /// doubles it.
    pub fn min_angular_size(&self, extra_levels: i32) -> f32 {
        let scale = self.octree_size_scale.max(f32::EPSILON);
        BASE_MIN_ANGULAR_SIZE / scale * 2f32.powi(self.boundary_level_adjust + extra_levels)
    }
}

/// Everything a traversal needs to judge relevance: the viewer's frustums,
/// its LOD and whether the view is currently moving.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ViewSet {
    pub frustums: Vec<ViewFrustum>,
    pub lod: LodParams,
    pub moving: bool,
}

impl ViewSet {
    pub fn new(frustums: Vec<ViewFrustum>, lod: LodParams) -> Self {
        Self {
            frustums,
            lod,
            moving: false,
        }
    }

    pub fn uses_frustums(&self) -> bool {
        !self.frustums.is_empty()
    }

    pub fn is_similar(&self, other: &ViewSet, tolerance: &FrustumTolerance) -> bool {
        self.frustums.len() == other.frustums.len()
            && self
                .frustums
                .iter()
                .zip(other.frustums.iter())
                .all(|(a, b)| a.is_similar(b, tolerance))
    }

    fn min_angular_size(&self) -> f32 {
        let extra = if self.moving { LOW_RES_MOVING_ADJUST } else { 0 };
        self.lod.min_angular_size(extra)
    }

    /// Whether anything inside the sphere could be sent. Used to prune cells.
    pub fn sphere_relevant(&self, center: Vec3, radius: f32) -> bool {
        if !self.uses_frustums() {
            return true;
        }
        let min_angular = self.min_angular_size();
        self.frustums.iter().any(|frustum| {
            frustum.sight(center, radius).is_some_and(|sighting| {
                angular_size(radius, sighting.distance) >= min_angular
            })
        })
    }

    /// Send priority for an element's bounding sphere: nearer, more central
    /// and larger elements rank higher. `None` means do not send.
    pub fn compute_priority(&self, center: Vec3, radius: f32) -> Option<f32> {
        if !self.uses_frustums() {
            return Some(WHEN_IN_DOUBT_PRIORITY);
        }
        let min_angular = self.min_angular_size();
        self.frustums
            .iter()
            .filter_map(|frustum| frustum.sight(center, radius))
            .filter_map(|sighting| {
                let size = angular_size(radius, sighting.distance);
                if size < min_angular {
                    return None;
                }
                let centrality = 0.5 + 0.5 * sighting.off_axis_cos;
                Some(size * (0.25 + 0.75 * centrality))
            })
            .max_by(f32::total_cmp)
    }
}

fn angular_size(radius: f32, distance: f32) -> f32 {
    radius.atan2(distance.max(f32::EPSILON))
}
