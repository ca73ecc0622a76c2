//! Full-stack runs: neural controllers evolving inside a world.

use neurodrive_brain::{ManualController, ManualInput, NeuralController};
use neurodrive_core::{Actuation, PhysicsWorld, Pose, Track, Vec3, World, WorldConfig};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::sync::{Arc, Mutex};

/// Stub physics pinning every vehicle to one spot partway along the track.
#[derive(Clone)]
struct PinnedPhysics {
    position: Vec3,
    applied: Arc<Mutex<Vec<Actuation>>>,
}

impl PinnedPhysics {
    fn new(position: Vec3) -> Self {
        Self {
            position,
            applied: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl PhysicsWorld for PinnedPhysics {
    fn pose(&self, _vehicle: usize) -> Pose {
        Pose::at(self.position)
    }

    fn velocity(&self, _vehicle: usize) -> Vec3 {
        Vec3::default()
    }

    fn cast_ray(&self, _vehicle: usize, _start: Vec3, _end: Vec3) -> Option<f32> {
        Some(0.5)
    }

    fn apply_actuation(&mut self, _vehicle: usize, actuation: Actuation) {
        self.applied.lock().expect("state").push(actuation);
    }

    fn reset_vehicle(&mut self, _vehicle: usize) {}
}

fn track() -> Track {
    Track::from_waypoints(vec![
        Vec3::new(0.0, 0.0, 0.0),
        Vec3::new(40.0, 0.0, 0.0),
        Vec3::new(40.0, 0.0, 40.0),
        Vec3::new(0.0, 0.0, 40.0),
    ])
    .expect("track")
}

fn neural_world(seed: u64, agents: usize) -> (World, PinnedPhysics) {
    let config = WorldConfig {
        population_size: agents,
        rng_seed: Some(seed),
        ..WorldConfig::default()
    };
    let physics = PinnedPhysics::new(Vec3::new(10.0, 0.0, 0.0));
    let mut rng = SmallRng::seed_from_u64(seed);
    let sensor_count = config.sensors.len();
    let settings = config.brain.clone();
    let limits = config.limits;
    let mut world =
        World::new(config, track(), Box::new(physics.clone())).expect("world");
    for _ in 0..agents {
        let controller =
            NeuralController::from_settings(&settings, limits, sensor_count, &mut rng)
                .expect("controller");
        world.spawn_agent(Box::new(controller)).expect("spawn");
    }
    (world, physics)
}

/// Step far enough past the stall timeout to end the generation. The pinned
/// vehicles never pass segment 2, so the stall predicate fires.
fn force_transition(world: &mut World) {
    let events = world.step(25.0);
    assert!(events.generation.is_some(), "expected a generation turnover");
}

#[test]
fn neural_agents_actuate_and_evolve() {
    let (mut world, physics) = neural_world(31, 5);

    let events = world.step(0.016);
    assert_eq!(events.alive, 5);
    {
        let applied = physics.applied.lock().expect("state");
        assert_eq!(applied.len(), 5);
        for actuation in applied.iter() {
            assert!(actuation.steer.abs() <= world.config().limits.steer_max);
        }
    }

    let parameter_count = world
        .agent(0)
        .expect("agent")
        .controller()
        .genome()
        .expect("genes")
        .len();
    force_transition(&mut world);

    assert_eq!(world.generation(), 1);
    let summary = world.history().back().expect("summary");
    assert!((summary.best_fitness - 10.0).abs() < 1e-4);
    for i in 0..world.agent_count() {
        let genes = world.agent(i).expect("agent").controller().genome().expect("genes");
        assert_eq!(genes.len(), parameter_count, "topology drifted for agent {i}");
    }
}

#[test]
fn single_agent_elitism_is_a_fixed_point() {
    let (mut world, _physics) = neural_world(17, 1);
    {
        let config = world.evolution_mut().config_mut();
        config.crossover_rate = 0.0;
        config.mutation_rate = 0.0;
    }
    let before = world.agent(0).expect("agent").controller().genome().expect("genes");

    for _ in 0..3 {
        force_transition(&mut world);
    }

    let after = world.agent(0).expect("agent").controller().genome().expect("genes");
    assert_eq!(after, before, "sole agent must carry over unchanged");
    assert_eq!(world.generation(), 3);
}

#[test]
fn evolved_genes_drive_a_working_network() {
    let (mut world, _physics) = neural_world(13, 4);
    force_transition(&mut world);

    // Post-transition controllers still produce in-range actuation from the
    // evolved weights.
    for i in 0..world.agent_count() {
        let agent = world.agent_mut(i).expect("agent");
        let distances: Vec<f32> = vec![1.0; 3];
        let actuation = agent
            .controller_mut()
            .actuate(0.016, &distances)
            .expect("actuation");
        assert!(actuation.steer.is_finite());
        assert!(actuation.force.is_finite());
    }
}

#[test]
fn manual_agent_coexists_with_evolving_population() {
    let config = WorldConfig {
        population_size: 4,
        rng_seed: Some(23),
        ..WorldConfig::default()
    };
    let sensor_count = config.sensors.len();
    let settings = config.brain.clone();
    let limits = config.limits;
    let physics = PinnedPhysics::new(Vec3::new(10.0, 0.0, 0.0));
    let mut rng = SmallRng::seed_from_u64(23);
    let mut world = World::new(config, track(), Box::new(physics)).expect("world");
    for _ in 0..3 {
        let controller =
            NeuralController::from_settings(&settings, limits, sensor_count, &mut rng)
                .expect("controller");
        world.spawn_agent(Box::new(controller)).expect("spawn");
    }
    let manual_index = world
        .spawn_agent(Box::new(ManualController::new(limits)))
        .expect("spawn");

    let manual = world
        .agent_mut(manual_index)
        .expect("agent")
        .controller_mut()
        .as_any_mut()
        .downcast_mut::<ManualController>()
        .expect("downcast");
    manual.set_input(ManualInput {
        throttle_forward: true,
        ..ManualInput::default()
    });

    force_transition(&mut world);

    // The manual agent was reset (held input cleared), the neural ones kept
    // valid genomes.
    let manual = world
        .agent(manual_index)
        .expect("agent")
        .controller()
        .as_any()
        .downcast_ref::<ManualController>()
        .expect("downcast");
    assert_eq!(manual.input(), ManualInput::default());
    for i in 0..manual_index {
        assert!(world.agent(i).expect("agent").controller().genome().is_some());
    }
}
