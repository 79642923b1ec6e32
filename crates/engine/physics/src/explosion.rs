//! Radial impulse around a point

use crate::engine::PhysicsEngine;
use crate::simulation::SimulationHandle;
use glam::Vec3;

/// Bodies this close to the center have no push direction
const MIN_DISTANCE_SQ: f32 = 1.0e-6;

/// Queue an explosion on the simulation thread
///
/// Returns false if the simulation is not running.
pub fn apply_explosion(sim: &SimulationHandle, center: Vec3, radius: f32, strength: f32) -> bool {
    if !(radius > 0.0) {
        return false;
    }
    sim.execute(move |engine| {
        let affected = explode(engine, center, radius, strength);
        tracing::debug!(%center, radius, strength, affected, "explosion applied");
    })
}

/// Push every dynamic body within `radius` away from `center`
///
/// The impulse magnitude falls off as `strength * (1 - d / radius)^2`.
/// Returns the number of bodies pushed.
pub fn explode(engine: &mut dyn PhysicsEngine, center: Vec3, radius: f32, strength: f32) -> usize {
    let radius_sq = radius * radius;
    let mut affected = 0;

    for (body, position) in engine.bodies_in_sphere(center, radius) {
        let offset = position - center;
        let distance_sq = offset.length_squared();
        if distance_sq >= radius_sq || distance_sq <= MIN_DISTANCE_SQ {
            continue;
        }
        let distance = distance_sq.sqrt();
        let falloff = 1.0 - distance / radius;
        let impulse = offset / distance * (strength * falloff * falloff);
        engine.apply_impulse(body, impulse);
        affected += 1;
    }
    affected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{BodyDesc, RapierEngine};

    #[test]
    fn test_explosion_pushes_outward() {
        let mut engine = RapierEngine::new(Vec3::ZERO);
        let near = engine
            .create_dynamic_body(&BodyDesc::cuboid(Vec3::new(2.0, 0.0, 0.0), Vec3::splat(0.5)))
            .unwrap();
        let centered = engine
            .create_dynamic_body(&BodyDesc::cuboid(Vec3::ZERO, Vec3::splat(0.5)))
            .unwrap();
        let far = engine
            .create_dynamic_body(&BodyDesc::cuboid(Vec3::new(20.0, 0.0, 0.0), Vec3::splat(0.5)))
            .unwrap();
        // Sphere queries see bodies once a step has indexed them
        engine.step(1.0 / 60.0);

        let affected = explode(&mut engine, Vec3::ZERO, 5.0, 100.0);
        assert_eq!(affected, 1);

        engine.step(1.0 / 60.0);
        assert!(engine.body_position(near).unwrap().x > 2.0);
        assert_eq!(engine.body_position(centered), Some(Vec3::ZERO));
        assert_eq!(engine.body_position(far), Some(Vec3::new(20.0, 0.0, 0.0)));
    }

    #[test]
    fn test_zero_radius_is_ignored() {
        let sim = crate::simulation::SimulationThread::spawn(Box::new(RapierEngine::new(Vec3::ZERO)))
            .unwrap();
        assert!(!apply_explosion(&sim.handle(), Vec3::ZERO, 0.0, 10.0));
        assert!(apply_explosion(&sim.handle(), Vec3::ZERO, 1.0, 10.0));
    }
}
