use super::{BodyDesc, BodyHandle, ConstraintHandle, EngineError, PhysicsEngine};
use crate::constraint::{
    ConstraintSettings, ConstraintSpace, DistanceSettings, FixedSettings, HingeSettings,
    PointSettings, SliderSettings,
};
use glam::Vec3;
use rapier3d::na::Unit;
use rapier3d::prelude::*;
use std::collections::HashMap;

/// Rapier-backed physics engine
///
/// Manages all rigid bodies, colliders, and joints. A fixed anchor body at the
/// origin stands in for "the world" when a constraint side has no body.
pub struct RapierEngine {
    rigid_body_set: RigidBodySet,
    collider_set: ColliderSet,
    impulse_joint_set: ImpulseJointSet,
    multibody_joint_set: MultibodyJointSet,
    integration_parameters: IntegrationParameters,
    physics_pipeline: PhysicsPipeline,
    island_manager: IslandManager,
    broad_phase: DefaultBroadPhase,
    narrow_phase: NarrowPhase,
    ccd_solver: CCDSolver,
    /// Refreshed by every step; sphere queries see bodies as of the last step
    query_pipeline: QueryPipeline,
    gravity: Vector<Real>,
    world_anchor: RigidBodyHandle,
    /// Body-local settings of every live joint
    canonical: HashMap<ConstraintHandle, ConstraintSettings>,
}

impl RapierEngine {
    /// Create a new engine with the given gravity vector
    pub fn new(gravity: Vec3) -> Self {
        let mut rigid_body_set = RigidBodySet::new();
        let world_anchor = rigid_body_set.insert(RigidBodyBuilder::fixed().build());

        Self {
            rigid_body_set,
            collider_set: ColliderSet::new(),
            impulse_joint_set: ImpulseJointSet::new(),
            multibody_joint_set: MultibodyJointSet::new(),
            integration_parameters: IntegrationParameters::default(),
            physics_pipeline: PhysicsPipeline::new(),
            island_manager: IslandManager::new(),
            broad_phase: DefaultBroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            ccd_solver: CCDSolver::new(),
            query_pipeline: QueryPipeline::new(),
            gravity: vector![gravity.x, gravity.y, gravity.z],
            world_anchor,
            canonical: HashMap::new(),
        }
    }

    pub fn gravity(&self) -> Vec3 {
        Vec3::new(self.gravity.x, self.gravity.y, self.gravity.z)
    }

    /// Number of bodies, excluding the world anchor
    pub fn body_count(&self) -> usize {
        self.rigid_body_set.len().saturating_sub(1)
    }

    pub fn constraint_count(&self) -> usize {
        self.impulse_joint_set.len()
    }

    fn rapier_handle(&self, body: BodyHandle) -> Result<RigidBodyHandle, EngineError> {
        let (index, generation) = body.into_raw_parts().ok_or(EngineError::UnknownBody(body))?;
        let handle = RigidBodyHandle::from_raw_parts(index, generation);
        if handle == self.world_anchor || !self.rigid_body_set.contains(handle) {
            return Err(EngineError::UnknownBody(body));
        }
        Ok(handle)
    }

    fn resolve_side(&self, body: Option<BodyHandle>) -> Result<RigidBodyHandle, EngineError> {
        match body {
            Some(body) => self.rapier_handle(body),
            None => Ok(self.world_anchor),
        }
    }

    fn body_isometry(&self, handle: RigidBodyHandle) -> Isometry<Real> {
        self.rigid_body_set
            .get(handle)
            .map(|b| *b.position())
            .unwrap_or_else(Isometry::identity)
    }
}

fn to_point(v: Vec3) -> Point<Real> {
    point![v.x, v.y, v.z]
}

fn to_vector(v: Vec3) -> Vector<Real> {
    vector![v.x, v.y, v.z]
}

fn to_unit(v: Vec3) -> Result<Unit<Vector<Real>>, EngineError> {
    Unit::try_new(to_vector(v), 1.0e-6)
        .ok_or_else(|| EngineError::InvalidSettings(format!("degenerate axis {v}")))
}

fn check_limits(limits: Option<[f32; 2]>) -> Result<(), EngineError> {
    match limits {
        Some([min, max]) if min > max => Err(EngineError::InvalidSettings(format!(
            "limit range [{min}, {max}] is inverted"
        ))),
        _ => Ok(()),
    }
}

/// Convert world-space anchors and axes into each body's frame
fn to_body_local(
    settings: &ConstraintSettings,
    iso_a: &Isometry<Real>,
    iso_b: &Isometry<Real>,
) -> ConstraintSettings {
    if settings.space() == ConstraintSpace::LocalToBody {
        return *settings;
    }
    let point = |iso: &Isometry<Real>, p: Vec3| {
        let local = iso.inverse_transform_point(&to_point(p));
        Vec3::new(local.x, local.y, local.z)
    };
    let axis = |iso: &Isometry<Real>, a: Vec3| {
        let local = iso.inverse_transform_vector(&to_vector(a));
        Vec3::new(local.x, local.y, local.z)
    };
    let space = ConstraintSpace::LocalToBody;

    match *settings {
        ConstraintSettings::Fixed(s) => ConstraintSettings::Fixed(FixedSettings {
            space,
            point1: point(iso_a, s.point1),
            point2: point(iso_b, s.point2),
        }),
        ConstraintSettings::Hinge(s) => ConstraintSettings::Hinge(HingeSettings {
            space,
            point1: point(iso_a, s.point1),
            point2: point(iso_b, s.point2),
            axis1: axis(iso_a, s.axis1),
            axis2: axis(iso_b, s.axis2),
            limits: s.limits,
        }),
        ConstraintSettings::Slider(s) => ConstraintSettings::Slider(SliderSettings {
            space,
            point1: point(iso_a, s.point1),
            point2: point(iso_b, s.point2),
            axis1: axis(iso_a, s.axis1),
            axis2: axis(iso_b, s.axis2),
            limits: s.limits,
        }),
        ConstraintSettings::Point(s) => ConstraintSettings::Point(PointSettings {
            space,
            point1: point(iso_a, s.point1),
            point2: point(iso_b, s.point2),
        }),
        ConstraintSettings::Distance(s) => ConstraintSettings::Distance(DistanceSettings {
            space,
            point1: point(iso_a, s.point1),
            point2: point(iso_b, s.point2),
            max_distance: s.max_distance,
        }),
    }
}

/// Build a joint from body-local settings
fn build_joint(settings: &ConstraintSettings) -> Result<GenericJoint, EngineError> {
    let joint: GenericJoint = match *settings {
        ConstraintSettings::Fixed(s) => FixedJointBuilder::new()
            .local_anchor1(to_point(s.point1))
            .local_anchor2(to_point(s.point2))
            .build()
            .into(),
        ConstraintSettings::Hinge(s) => {
            check_limits(s.limits)?;
            let mut builder = RevoluteJointBuilder::new(to_unit(s.axis1)?)
                .local_anchor1(to_point(s.point1))
                .local_anchor2(to_point(s.point2));
            if let Some(limits) = s.limits {
                builder = builder.limits(limits);
            }
            let mut joint: GenericJoint = builder.build().into();
            joint.set_local_axis2(to_unit(s.axis2)?);
            joint
        }
        ConstraintSettings::Slider(s) => {
            check_limits(s.limits)?;
            let mut builder = PrismaticJointBuilder::new(to_unit(s.axis1)?)
                .local_anchor1(to_point(s.point1))
                .local_anchor2(to_point(s.point2));
            if let Some(limits) = s.limits {
                builder = builder.limits(limits);
            }
            let mut joint: GenericJoint = builder.build().into();
            joint.set_local_axis2(to_unit(s.axis2)?);
            joint
        }
        ConstraintSettings::Point(s) => SphericalJointBuilder::new()
            .local_anchor1(to_point(s.point1))
            .local_anchor2(to_point(s.point2))
            .build()
            .into(),
        ConstraintSettings::Distance(s) => {
            if !(s.max_distance > 0.0) {
                return Err(EngineError::InvalidSettings(format!(
                    "max distance must be positive, got {}",
                    s.max_distance
                )));
            }
            RopeJointBuilder::new(s.max_distance)
                .local_anchor1(to_point(s.point1))
                .local_anchor2(to_point(s.point2))
                .build()
                .into()
        }
    };
    Ok(joint)
}

impl PhysicsEngine for RapierEngine {
    fn create_static_body(
        &mut self,
        origin: Vec3,
        shape: &SharedShape,
    ) -> Result<BodyHandle, EngineError> {
        let body = RigidBodyBuilder::fixed().translation(to_vector(origin)).build();
        let handle = self.rigid_body_set.insert(body);
        let collider = ColliderBuilder::new(shape.clone()).build();
        self.collider_set
            .insert_with_parent(collider, handle, &mut self.rigid_body_set);

        let (index, generation) = handle.into_raw_parts();
        Ok(BodyHandle::from_raw_parts(index, generation))
    }

    fn set_body_shape(
        &mut self,
        body: BodyHandle,
        shape: &SharedShape,
    ) -> Result<(), EngineError> {
        let handle = self.rapier_handle(body)?;
        let colliders: Vec<ColliderHandle> = self
            .rigid_body_set
            .get(handle)
            .map(|b| b.colliders().to_vec())
            .unwrap_or_default();

        match colliders.split_first() {
            Some((first, rest)) => {
                if let Some(collider) = self.collider_set.get_mut(*first) {
                    collider.set_shape(shape.clone());
                }
                for extra in rest {
                    self.collider_set.remove(
                        *extra,
                        &mut self.island_manager,
                        &mut self.rigid_body_set,
                        true,
                    );
                }
            }
            None => {
                let collider = ColliderBuilder::new(shape.clone()).build();
                self.collider_set
                    .insert_with_parent(collider, handle, &mut self.rigid_body_set);
            }
        }
        Ok(())
    }

    fn create_dynamic_body(&mut self, desc: &BodyDesc) -> Result<BodyHandle, EngineError> {
        let he = desc.half_extents;
        if he.min_element() <= 0.0 {
            return Err(EngineError::InvalidShape(format!(
                "half extents must be positive, got {he}"
            )));
        }
        if !(desc.density > 0.0) {
            return Err(EngineError::InvalidShape(format!(
                "density must be positive, got {}",
                desc.density
            )));
        }

        let body = RigidBodyBuilder::dynamic()
            .translation(to_vector(desc.position))
            .build();
        let handle = self.rigid_body_set.insert(body);
        let collider = ColliderBuilder::cuboid(he.x, he.y, he.z)
            .density(desc.density)
            .build();
        self.collider_set
            .insert_with_parent(collider, handle, &mut self.rigid_body_set);

        let (index, generation) = handle.into_raw_parts();
        Ok(BodyHandle::from_raw_parts(index, generation))
    }

    fn remove_body(&mut self, body: BodyHandle) {
        let Ok(handle) = self.rapier_handle(body) else {
            return;
        };
        self.rigid_body_set.remove(
            handle,
            &mut self.island_manager,
            &mut self.collider_set,
            &mut self.impulse_joint_set,
            &mut self.multibody_joint_set,
            true,
        );
        // Attached joints went with the body
        let joints = &self.impulse_joint_set;
        self.canonical.retain(|h, _| {
            let (index, generation) = h.into_raw_parts();
            joints
                .get(ImpulseJointHandle::from_raw_parts(index, generation))
                .is_some()
        });
    }

    fn body_position(&self, body: BodyHandle) -> Option<Vec3> {
        let handle = self.rapier_handle(body).ok()?;
        let t = self.rigid_body_set.get(handle)?.translation();
        Some(Vec3::new(t.x, t.y, t.z))
    }

    fn create_constraint(
        &mut self,
        settings: &ConstraintSettings,
        body_a: Option<BodyHandle>,
        body_b: Option<BodyHandle>,
    ) -> Result<ConstraintHandle, EngineError> {
        let handle_a = self.resolve_side(body_a)?;
        let handle_b = self.resolve_side(body_b)?;
        if handle_a == handle_b {
            return Err(EngineError::Rejected(
                "constraint endpoints resolve to the same body".to_string(),
            ));
        }

        let local = to_body_local(
            settings,
            &self.body_isometry(handle_a),
            &self.body_isometry(handle_b),
        );
        let joint = build_joint(&local)?;
        let joint_handle = self.impulse_joint_set.insert(handle_a, handle_b, joint, true);

        let (index, generation) = joint_handle.into_raw_parts();
        let handle = ConstraintHandle::from_raw_parts(index, generation);
        self.canonical.insert(handle, local);
        Ok(handle)
    }

    fn constraint_settings(&self, constraint: ConstraintHandle) -> Option<ConstraintSettings> {
        self.canonical.get(&constraint).copied()
    }

    fn remove_constraint(&mut self, constraint: ConstraintHandle) {
        if self.canonical.remove(&constraint).is_none() {
            return;
        }
        let (index, generation) = constraint.into_raw_parts();
        self.impulse_joint_set
            .remove(ImpulseJointHandle::from_raw_parts(index, generation), true);
    }

    fn bodies_in_sphere(&self, center: Vec3, radius: f32) -> Vec<(BodyHandle, Vec3)> {
        let radius_sq = radius * radius;
        let ball = Ball::new(radius);
        let ball_pos = Isometry::translation(center.x, center.y, center.z);
        let mut found: Vec<RigidBodyHandle> = Vec::new();

        self.query_pipeline.intersections_with_shape(
            &self.rigid_body_set,
            &self.collider_set,
            &ball_pos,
            &ball,
            QueryFilter::only_dynamic(),
            |collider| {
                if let Some(parent) = self.collider_set.get(collider).and_then(|c| c.parent()) {
                    if !found.contains(&parent) {
                        found.push(parent);
                    }
                }
                true
            },
        );

        found
            .into_iter()
            .filter_map(|handle| {
                let body = self.rigid_body_set.get(handle)?;
                let t = body.translation();
                let position = Vec3::new(t.x, t.y, t.z);
                if position.distance_squared(center) > radius_sq {
                    return None;
                }
                let (index, generation) = handle.into_raw_parts();
                Some((BodyHandle::from_raw_parts(index, generation), position))
            })
            .collect()
    }

    fn apply_impulse(&mut self, body: BodyHandle, impulse: Vec3) {
        let Ok(handle) = self.rapier_handle(body) else {
            return;
        };
        if let Some(body) = self.rigid_body_set.get_mut(handle) {
            body.apply_impulse(to_vector(impulse), true);
        }
    }

    fn step(&mut self, dt: f32) {
        self.integration_parameters.dt = dt;

        self.physics_pipeline.step(
            &self.gravity,
            &self.integration_parameters,
            &mut self.island_manager,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.rigid_body_set,
            &mut self.collider_set,
            &mut self.impulse_joint_set,
            &mut self.multibody_joint_set,
            &mut self.ccd_solver,
            Some(&mut self.query_pipeline),
            &(),
            &(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RapierEngine {
        RapierEngine::new(Vec3::new(0.0, -9.81, 0.0))
    }

    fn box_desc(position: Vec3) -> BodyDesc {
        BodyDesc::cuboid(position, Vec3::splat(0.5))
    }

    #[test]
    fn test_engine_creation() {
        let engine = engine();
        assert_eq!(engine.gravity(), Vec3::new(0.0, -9.81, 0.0));
        assert_eq!(engine.body_count(), 0);
    }

    #[test]
    fn test_gravity_simulation() {
        let mut engine = engine();
        let body = engine
            .create_dynamic_body(&box_desc(Vec3::new(0.0, 10.0, 0.0)))
            .unwrap();

        for _ in 0..30 {
            engine.step(1.0 / 60.0);
        }

        assert!(engine.body_position(body).unwrap().y < 10.0);
    }

    #[test]
    fn test_static_body_with_compound_shape() {
        let mut engine = engine();
        let shape = SharedShape::compound(vec![
            (Isometry::translation(0.5, 0.5, 0.5), SharedShape::cuboid(0.5, 0.5, 0.5)),
            (Isometry::translation(1.5, 0.5, 0.5), SharedShape::cuboid(0.5, 0.5, 0.5)),
        ]);
        let body = engine
            .create_static_body(Vec3::new(16.0, 0.0, 0.0), &shape)
            .unwrap();
        assert_eq!(engine.body_position(body), Some(Vec3::new(16.0, 0.0, 0.0)));

        let replacement = SharedShape::cuboid(8.0, 8.0, 8.0);
        engine.set_body_shape(body, &replacement).unwrap();
        assert_eq!(engine.body_count(), 1);
    }

    #[test]
    fn test_static_bodies_not_in_sphere() {
        let mut engine = RapierEngine::new(Vec3::ZERO);
        engine
            .create_static_body(Vec3::ZERO, &SharedShape::cuboid(1.0, 1.0, 1.0))
            .unwrap();
        let dynamic = engine.create_dynamic_body(&box_desc(Vec3::X)).unwrap();
        engine
            .create_dynamic_body(&box_desc(Vec3::new(50.0, 0.0, 0.0)))
            .unwrap();
        engine.step(1.0 / 60.0);

        let hits = engine.bodies_in_sphere(Vec3::ZERO, 5.0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, dynamic);
    }

    #[test]
    fn test_sphere_query_skips_removed_body() {
        let mut engine = RapierEngine::new(Vec3::ZERO);
        let kept = engine.create_dynamic_body(&box_desc(Vec3::Y)).unwrap();
        let removed = engine.create_dynamic_body(&box_desc(Vec3::NEG_Y)).unwrap();
        engine.step(1.0 / 60.0);
        engine.remove_body(removed);

        let hits = engine.bodies_in_sphere(Vec3::ZERO, 3.0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, kept);
    }

    #[test]
    fn test_invalid_body_desc_rejected() {
        let mut engine = engine();
        let result = engine.create_dynamic_body(&BodyDesc::cuboid(Vec3::ZERO, Vec3::ZERO));
        assert!(matches!(result, Err(EngineError::InvalidShape(_))));
    }

    #[test]
    fn test_world_space_settings_become_body_local() {
        let mut engine = engine();
        let body = engine
            .create_dynamic_body(&box_desc(Vec3::new(2.0, 3.0, 4.0)))
            .unwrap();
        let settings = ConstraintSettings::Point(PointSettings {
            space: ConstraintSpace::WorldSpace,
            point1: Vec3::new(2.0, 4.0, 4.0),
            point2: Vec3::new(2.0, 4.0, 4.0),
        });

        let handle = engine.create_constraint(&settings, Some(body), None).unwrap();
        let canonical = engine.constraint_settings(handle).unwrap();

        assert_eq!(canonical.space(), ConstraintSpace::LocalToBody);
        let (p1, p2) = canonical.anchors();
        assert!((p1 - Vec3::new(0.0, 1.0, 0.0)).length() < 1e-5);
        // World anchor sits at the origin
        assert!((p2 - Vec3::new(2.0, 4.0, 4.0)).length() < 1e-5);
    }

    #[test]
    fn test_degenerate_hinge_axis_rejected() {
        let mut engine = engine();
        let a = engine.create_dynamic_body(&box_desc(Vec3::ZERO)).unwrap();
        let b = engine.create_dynamic_body(&box_desc(Vec3::X)).unwrap();
        let settings = ConstraintSettings::Hinge(HingeSettings {
            space: ConstraintSpace::LocalToBody,
            point1: Vec3::ZERO,
            point2: Vec3::ZERO,
            axis1: Vec3::ZERO,
            axis2: Vec3::Y,
            limits: None,
        });

        let result = engine.create_constraint(&settings, Some(a), Some(b));
        assert!(matches!(result, Err(EngineError::InvalidSettings(_))));
        assert_eq!(engine.constraint_count(), 0);
    }

    #[test]
    fn test_remove_body_drops_attached_constraints() {
        let mut engine = engine();
        let a = engine.create_dynamic_body(&box_desc(Vec3::ZERO)).unwrap();
        let b = engine.create_dynamic_body(&box_desc(Vec3::X)).unwrap();
        let settings = ConstraintSettings::Distance(DistanceSettings {
            space: ConstraintSpace::LocalToBody,
            point1: Vec3::ZERO,
            point2: Vec3::ZERO,
            max_distance: 2.0,
        });
        let handle = engine.create_constraint(&settings, Some(a), Some(b)).unwrap();
        assert_eq!(engine.constraint_count(), 1);

        engine.remove_body(a);

        assert_eq!(engine.constraint_count(), 0);
        assert!(engine.constraint_settings(handle).is_none());
        assert!(engine.body_position(a).is_none());
    }

    #[test]
    fn test_unknown_body_rejected() {
        let mut engine = engine();
        let ghost = BodyHandle::from_raw_parts(999, 0);
        let settings = ConstraintSettings::Fixed(FixedSettings {
            space: ConstraintSpace::LocalToBody,
            point1: Vec3::ZERO,
            point2: Vec3::ZERO,
        });
        let result = engine.create_constraint(&settings, Some(ghost), None);
        assert!(matches!(result, Err(EngineError::UnknownBody(_))));
    }
}
