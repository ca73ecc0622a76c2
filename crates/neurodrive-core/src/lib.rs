//! Core types shared across the neurodrive workspace.
//!
//! The world model is deliberately single-threaded and tick-driven: one
//! `step` advances every living agent, and a stop-the-world generation
//! transition runs only once the whole population is dead. Physics,
//! rendering, and asset loading stay outside the crate behind the
//! [`PhysicsWorld`] seam.

use ordered_float::OrderedFloat;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cmp::Reverse;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use thiserror::Error;
use tracing::{debug, warn};

/// Number of actuation channels produced by a controller (steer, drive force).
pub const ACTUATION_DOF: usize = 2;

/// Selection weights are floored at this value so zero-distance agents keep a
/// nonzero selection probability and roulette sampling never divides by zero.
const FITNESS_FLOOR: f32 = 1e-4;

/// Segments shorter than this are skipped during projection.
const SEGMENT_EPSILON: f32 = 1e-6;

// ---------------------------------------------------------------------------
// Math primitives
// ---------------------------------------------------------------------------

/// 3D vector used for waypoints, poses, and sensor rays.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    #[must_use]
    pub fn dot(self, other: Self) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    #[must_use]
    pub fn length_squared(self) -> f32 {
        self.dot(self)
    }

    #[must_use]
    pub fn length(self) -> f32 {
        self.length_squared().sqrt()
    }
}

impl std::ops::Add for Vec3 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl std::ops::Sub for Vec3 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl std::ops::Mul<f32> for Vec3 {
    type Output = Self;

    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// World transform of a vehicle chassis: position plus orthonormal basis
/// (`axes[0]` = right, `axes[1]` = up, `axes[2]` = forward).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Pose {
    pub position: Vec3,
    pub axes: [Vec3; 3],
}

impl Default for Pose {
    fn default() -> Self {
        Self {
            position: Vec3::default(),
            axes: [
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
                Vec3::new(0.0, 0.0, 1.0),
            ],
        }
    }
}

impl Pose {
    /// Construct a pose with the identity orientation.
    #[must_use]
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    /// Map a chassis-local point into world space.
    #[must_use]
    pub fn transform_point(&self, local: Vec3) -> Vec3 {
        self.position
            + self.axes[0] * local.x
            + self.axes[1] * local.y
            + self.axes[2] * local.z
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Fatal setup errors; these abort world construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorldError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The configured population size has already been spawned.
    #[error("population is full ({capacity} agents)")]
    PopulationFull { capacity: usize },
}

/// Gene-transfer failures. Recoverable per call: the offending transfer is
/// skipped and reported, the simulation continues.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GenomeError {
    #[error("gene vector has {actual} genes, owner expects {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Failures raised by the evolution engine.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EvolutionError {
    #[error("cannot evolve an empty population")]
    EmptyPopulation,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Local-space mounting of one sensor ray on the vehicle chassis.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SensorMount {
    pub start: Vec3,
    pub end: Vec3,
}

/// Network topology and weight-initialization settings consumed by the brain
/// crate when constructing neural controllers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrainSettings {
    /// Hidden layer sizes between the sensor and actuation layers.
    pub hidden_layers: Vec<usize>,
    /// Lower bound of the uniform weight initialization range.
    pub weight_min: f32,
    /// Upper bound of the uniform weight initialization range.
    pub weight_max: f32,
}

impl Default for BrainSettings {
    fn default() -> Self {
        Self {
            hidden_layers: vec![4, 3],
            weight_min: -1.0,
            weight_max: 1.0,
        }
    }
}

/// Clamp ranges for the actuation channels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ControlLimits {
    /// Maximum steering angle in radians.
    pub steer_max: f32,
    /// Maximum forward engine force.
    pub force_forward_max: f32,
    /// Maximum reverse engine force (negative).
    pub force_reverse_max: f32,
    /// Handbrake force.
    pub brake_max: f32,
    /// Rolling-friction brake applied while the manual throttle is released.
    pub idle_brake: f32,
}

impl Default for ControlLimits {
    fn default() -> Self {
        Self {
            steer_max: 0.6,
            force_forward_max: 5_000.0,
            force_reverse_max: -3_000.0,
            brake_max: 500.0,
            idle_brake: 10.0,
        }
    }
}

/// Tunable parameters of the genetic algorithm. All four are runtime
/// adjustable through [`World::evolution_mut`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EvolutionConfig {
    /// Fraction of the population carried over unchanged, best first.
    /// At least one individual is always carried.
    pub elitism_fraction: f32,
    /// Probability that a non-elite slot is filled by uniform crossover of
    /// two parents rather than a verbatim copy of one.
    pub crossover_rate: f32,
    /// Per-gene probability of a mutation perturbation.
    pub mutation_rate: f32,
    /// Maximum magnitude of one uniform mutation perturbation.
    pub mutation_max_change: f32,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            elitism_fraction: 0.25,
            crossover_rate: 1.0,
            mutation_rate: 0.05,
            mutation_max_change: 1.0,
        }
    }
}

/// Static configuration for a neurodrive world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldConfig {
    /// Number of vehicles the orchestrator intends to spawn.
    pub population_size: usize,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Chassis-local sensor rig shared by every vehicle.
    pub sensors: Vec<SensorMount>,
    /// Network construction settings for neural controllers.
    pub brain: BrainSettings,
    /// Actuation clamp ranges shared by every controller variant.
    pub limits: ControlLimits,
    /// Genetic algorithm tunables.
    pub evolution: EvolutionConfig,
    /// Seconds since birth after which a vehicle below
    /// `min_progress_segment` is killed.
    pub stall_timeout_secs: f64,
    /// Segment index a vehicle must reach before the stall timeout elapses.
    pub min_progress_segment: i32,
    /// Squared velocity magnitude below which the travel direction reads 0.
    pub velocity_epsilon: f32,
    /// Maximum number of generation summaries retained in memory.
    pub history_capacity: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            population_size: 40,
            rng_seed: None,
            sensors: default_sensor_rig(),
            brain: BrainSettings::default(),
            limits: ControlLimits::default(),
            evolution: EvolutionConfig::default(),
            stall_timeout_secs: 20.0,
            min_progress_segment: 2,
            velocity_epsilon: 1e-6,
            history_capacity: 64,
        }
    }
}

impl WorldConfig {
    /// Validates the configuration.
    fn validate(&self) -> Result<(), WorldError> {
        if self.population_size == 0 {
            return Err(WorldError::InvalidConfig(
                "population_size must be non-zero",
            ));
        }
        if self.sensors.is_empty() {
            return Err(WorldError::InvalidConfig(
                "at least one sensor mount is required",
            ));
        }
        if self.brain.hidden_layers.is_empty() {
            return Err(WorldError::InvalidConfig(
                "at least one hidden layer is required",
            ));
        }
        if self.brain.weight_min > self.brain.weight_max {
            return Err(WorldError::InvalidConfig(
                "weight_min must not exceed weight_max",
            ));
        }
        if self.stall_timeout_secs <= 0.0 {
            return Err(WorldError::InvalidConfig(
                "stall_timeout_secs must be positive",
            ));
        }
        if self.min_progress_segment < 0 {
            return Err(WorldError::InvalidConfig(
                "min_progress_segment must be non-negative",
            ));
        }
        if self.velocity_epsilon < 0.0 {
            return Err(WorldError::InvalidConfig(
                "velocity_epsilon must be non-negative",
            ));
        }
        if self.history_capacity == 0 {
            return Err(WorldError::InvalidConfig(
                "history_capacity must be non-zero",
            ));
        }
        let ev = &self.evolution;
        if !(0.0..=1.0).contains(&ev.elitism_fraction)
            || !(0.0..=1.0).contains(&ev.crossover_rate)
            || !(0.0..=1.0).contains(&ev.mutation_rate)
        {
            return Err(WorldError::InvalidConfig(
                "elitism, crossover, and mutation rates must lie in [0, 1]",
            ));
        }
        if ev.mutation_max_change < 0.0 {
            return Err(WorldError::InvalidConfig(
                "mutation_max_change must be non-negative",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG, seeding from entropy if no seed is set.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// The three-ray rig of the reference vehicle: one ray straight ahead and one
/// angled out from each front corner, end points pushed out to 5x the modeled
/// offsets.
#[must_use]
pub fn default_sensor_rig() -> Vec<SensorMount> {
    const RIG: [[f32; 6]; 3] = [
        [0.0209, 1.5, 1.0072, 0.0209, 1.5, 5.0666],
        [-0.5070, 1.5, 0.9990, -3.1516, 1.5, 4.2972],
        [0.4965, 1.5, 1.0095, 3.3649, 1.5, 4.4035],
    ];
    const REACH: f32 = 5.0;

    RIG.iter()
        .map(|row| {
            let start = Vec3::new(row[0], row[1], row[2]);
            let end = Vec3::new(row[3], row[4], row[5]);
            SensorMount {
                start,
                end: start + (end - start) * REACH,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Track geometry and progress
// ---------------------------------------------------------------------------

/// Closed waypoint polyline with a cumulative arclength table. Read-only
/// after construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Track {
    waypoints: Vec<Vec3>,
    cumulative: Vec<f32>,
}

/// Result of projecting a world position onto the nearest track segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackProjection {
    /// Index of the segment the position projects onto.
    pub segment: usize,
    /// Signed distance along the segment's unit direction, in `[0, len]`.
    pub along: f32,
    /// Perpendicular distance from the position to the segment.
    pub lateral: f32,
    /// Unit direction of the segment.
    pub direction: Vec3,
    /// Scalar track distance: `cumulative[segment] + along`.
    pub track_distance: f32,
}

impl Track {
    /// Build a track from an ordered, closed waypoint loop, computing the
    /// cumulative arclength table.
    pub fn from_waypoints(waypoints: Vec<Vec3>) -> Result<Self, WorldError> {
        if waypoints.len() < 2 {
            return Err(WorldError::InvalidConfig(
                "a track needs at least two waypoints",
            ));
        }
        let mut cumulative = vec![0.0; waypoints.len()];
        let mut accum = 0.0;
        for i in 1..waypoints.len() {
            accum += (waypoints[i] - waypoints[i - 1]).length();
            cumulative[i] = accum;
        }
        Self::new(waypoints, cumulative)
    }

    /// Build a track from a precomputed cumulative distance table, as loaded
    /// by an external track-asset collaborator.
    pub fn new(waypoints: Vec<Vec3>, cumulative: Vec<f32>) -> Result<Self, WorldError> {
        if waypoints.len() < 2 {
            return Err(WorldError::InvalidConfig(
                "a track needs at least two waypoints",
            ));
        }
        if cumulative.len() != waypoints.len() {
            return Err(WorldError::InvalidConfig(
                "cumulative table length must match the waypoint count",
            ));
        }
        if cumulative[0] != 0.0 {
            return Err(WorldError::InvalidConfig(
                "cumulative table must start at zero",
            ));
        }
        if cumulative.windows(2).any(|pair| pair[1] < pair[0]) {
            return Err(WorldError::InvalidConfig(
                "cumulative table must be non-decreasing",
            ));
        }
        let total = cumulative[cumulative.len() - 1];
        if total <= SEGMENT_EPSILON {
            return Err(WorldError::InvalidConfig(
                "track has no measurable length",
            ));
        }
        Ok(Self {
            waypoints,
            cumulative,
        })
    }

    #[must_use]
    pub fn waypoints(&self) -> &[Vec3] {
        &self.waypoints
    }

    #[must_use]
    pub fn cumulative(&self) -> &[f32] {
        &self.cumulative
    }

    /// Number of segments in the closed loop (equals the waypoint count).
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.waypoints.len()
    }

    /// Brute-force nearest-segment projection, restricted to segments where
    /// the projection parameter falls inside the segment. Returns `None` when
    /// no segment qualifies; callers leave prior progress untouched in that
    /// case.
    #[must_use]
    pub fn project(&self, position: Vec3) -> Option<TrackProjection> {
        let count = self.waypoints.len();
        let mut nearest: Option<TrackProjection> = None;

        for i in 0..count {
            let a = self.waypoints[i];
            let delta = self.waypoints[(i + 1) % count] - a;
            let len = delta.length();
            if len <= SEGMENT_EPSILON {
                continue;
            }
            let direction = delta * (1.0 / len);
            let along = (position - a).dot(direction);
            if along < 0.0 || along > len {
                continue;
            }
            let foot = a + direction * along;
            let lateral = (position - foot).length();
            if nearest.is_none_or(|best| lateral < best.lateral) {
                nearest = Some(TrackProjection {
                    segment: i,
                    along,
                    lateral,
                    direction,
                    track_distance: self.cumulative[i] + along,
                });
            }
        }

        nearest
    }
}

/// Per-agent track progress and survival state. Mutated only by the tick
/// pipeline and the kill/reset mutators.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ProgressState {
    /// Segment the agent most recently projected onto.
    pub current_segment: i32,
    /// Highest segment index reached this generation.
    pub best_segment: i32,
    /// Track distance at the most recent projection.
    pub current_distance: f32,
    /// Highest track distance reached this generation; the fitness signal.
    pub best_distance: f32,
    /// Sign of `velocity . segment_direction`: -1, 0, or +1.
    pub travel_direction: i8,
    pub alive: bool,
    /// Simulation time at which this agent was (re)born.
    pub birth_time: f64,
}

impl ProgressState {
    #[must_use]
    pub fn new(birth_time: f64) -> Self {
        Self {
            current_segment: 0,
            best_segment: 0,
            current_distance: 0.0,
            best_distance: 0.0,
            travel_direction: 0,
            alive: true,
            birth_time,
        }
    }

    /// Restore initial values and re-seed the birth time.
    pub fn reset(&mut self, now: f64) {
        *self = Self::new(now);
    }

    /// Transition alive to dead. Idempotent; only `reset` revives.
    pub fn kill(&mut self) {
        self.alive = false;
    }

    /// Fold one projection into the running progress state. Best values are
    /// running maxima and never decrease.
    pub fn observe(&mut self, projection: &TrackProjection, velocity: Vec3, velocity_epsilon: f32) {
        let along = velocity.dot(projection.direction);
        if velocity.length_squared() < velocity_epsilon {
            self.travel_direction = 0;
        } else if along > 0.0 {
            self.travel_direction = 1;
        } else if along < 0.0 {
            self.travel_direction = -1;
        }

        let segment = projection.segment as i32;
        self.current_segment = segment;
        self.current_distance = projection.track_distance;
        self.best_segment = self.best_segment.max(segment);
        self.best_distance = self.best_distance.max(projection.track_distance);
    }

    /// Off-course kill predicate: the current segment index went negative.
    #[must_use]
    pub fn off_course(&self) -> bool {
        self.current_segment < 0
    }

    /// Reverse-travel kill predicate: the vehicle is moving against the
    /// track direction.
    #[must_use]
    pub fn wrong_direction(&self) -> bool {
        self.travel_direction < 0
    }

    /// Stall kill predicate: alive past the timeout without reaching the
    /// minimum-progress segment.
    #[must_use]
    pub fn stalled(&self, now: f64, timeout_secs: f64, min_segment: i32) -> bool {
        now - self.birth_time > timeout_secs && self.current_segment < min_segment
    }
}

// ---------------------------------------------------------------------------
// Sensors
// ---------------------------------------------------------------------------

/// One perception ray mounted on the chassis. World-space endpoints and the
/// hit distance are refreshed every tick from the physics collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorRay {
    start_local: Vec3,
    end_local: Vec3,
    start_world: Vec3,
    end_world: Vec3,
    max_length: f32,
    distance: f32,
}

impl SensorRay {
    #[must_use]
    pub fn new(mount: SensorMount) -> Self {
        let max_length = (mount.end - mount.start).length();
        Self {
            start_local: mount.start,
            end_local: mount.end,
            start_world: mount.start,
            end_world: mount.end,
            max_length,
            distance: max_length,
        }
    }

    /// Recompute the world-space endpoints from the current chassis pose.
    pub fn refresh(&mut self, pose: &Pose) {
        self.start_world = pose.transform_point(self.start_local);
        self.end_world = pose.transform_point(self.end_local);
    }

    /// Fold in the raycast result: `hit_distance = max_length * fraction`,
    /// or the full ray length when nothing was hit.
    pub fn observe_hit(&mut self, fraction: Option<f32>) {
        self.distance = match fraction {
            Some(fraction) => self.max_length * fraction.clamp(0.0, 1.0),
            None => self.max_length,
        };
    }

    /// Clear the hit distance back to the unobstructed ray length.
    pub fn reset(&mut self) {
        self.distance = self.max_length;
    }

    #[must_use]
    pub fn start_world(&self) -> Vec3 {
        self.start_world
    }

    #[must_use]
    pub fn end_world(&self) -> Vec3 {
        self.end_world
    }

    #[must_use]
    pub const fn max_length(&self) -> f32 {
        self.max_length
    }

    /// Current hit distance along the ray.
    #[must_use]
    pub const fn distance(&self) -> f32 {
        self.distance
    }
}

// ---------------------------------------------------------------------------
// Controllers and physics collaborators
// ---------------------------------------------------------------------------

/// 2-DOF actuation command handed to the physics collaborator each tick. The
/// brake channel is only driven by the manual variant.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Actuation {
    /// Steering angle in radians, already clamped to the steer limit.
    pub steer: f32,
    /// Engine force; negative values reverse.
    pub force: f32,
    /// Brake force.
    pub brake: f32,
}

/// Capability set over "what decides actuation this tick". Selected at agent
/// construction and swappable at runtime by replacing the boxed variant.
pub trait Controller: Send {
    /// Identifier for diagnostics and HUD display.
    fn kind(&self) -> &'static str;

    /// Compute this tick's actuation from the sensor-distance vector.
    /// Returns `None` when no actuation should be applied (reported, never
    /// fatal).
    fn actuate(&mut self, dt: f64, sensor_distances: &[f32]) -> Option<Actuation>;

    /// Flatten the controller's evolvable parameters into a gene vector.
    /// Non-evolvable variants return `None` and are skipped by evolution.
    fn genome(&self) -> Option<Vec<f32>> {
        None
    }

    /// Install a gene vector produced by the evolution engine.
    fn apply_genome(&mut self, _genes: &[f32]) -> Result<(), GenomeError> {
        Ok(())
    }

    /// Clear any per-generation state at a generation boundary.
    fn reset(&mut self) {}

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// External rigid-body/raycast collaborator. One implementation per physics
/// backend; [`NullPhysics`] is the inert default used by tests and benches.
pub trait PhysicsWorld: Send {
    /// Current world transform of a vehicle chassis.
    fn pose(&self, vehicle: usize) -> Pose;

    /// Current linear velocity of a vehicle.
    fn velocity(&self, vehicle: usize) -> Vec3;

    /// Fraction along `[start, end]` of the nearest hit, if any. The vehicle
    /// index lets implementations exclude the caster's own body.
    fn cast_ray(&self, vehicle: usize, start: Vec3, end: Vec3) -> Option<f32>;

    /// Apply one actuation command to a vehicle.
    fn apply_actuation(&mut self, vehicle: usize, actuation: Actuation);

    /// Restore a vehicle's rigid body to its spawn state.
    fn reset_vehicle(&mut self, vehicle: usize);
}

/// Physics sink that reports identity poses and swallows actuation.
#[derive(Debug, Default)]
pub struct NullPhysics;

impl PhysicsWorld for NullPhysics {
    fn pose(&self, _vehicle: usize) -> Pose {
        Pose::default()
    }

    fn velocity(&self, _vehicle: usize) -> Vec3 {
        Vec3::default()
    }

    fn cast_ray(&self, _vehicle: usize, _start: Vec3, _end: Vec3) -> Option<f32> {
        None
    }

    fn apply_actuation(&mut self, _vehicle: usize, _actuation: Actuation) {}

    fn reset_vehicle(&mut self, _vehicle: usize) {}
}

// ---------------------------------------------------------------------------
// Genetic encoding and evolution
// ---------------------------------------------------------------------------

/// One agent's flat gene vector tagged with the fitness it earned. The
/// average-fitness normalizer is not stored here; the world passes a
/// per-transition snapshot into [`EvolutionEngine::evolve`] instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Genome {
    pub genes: Vec<f32>,
    pub fitness: f32,
}

/// Generational genetic algorithm: fitness-proportionate selection with an
/// epsilon floor, elite carryover, uniform crossover, bounded uniform
/// mutation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvolutionEngine {
    config: EvolutionConfig,
}

impl EvolutionEngine {
    #[must_use]
    pub fn new(config: EvolutionConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &EvolutionConfig {
        &self.config
    }

    /// Live-tunable parameters; a debug surface reads and writes this.
    pub fn config_mut(&mut self) -> &mut EvolutionConfig {
        &mut self.config
    }

    /// Fill `next` with the successor generation of `current`.
    ///
    /// `avg_fitness` is the population-average fitness snapshot taken by the
    /// orchestrator before the transition; it normalizes selection weights
    /// and is never read back after this call. Population size is invariant.
    pub fn evolve<R: Rng>(
        &self,
        current: &[Genome],
        next: &mut Vec<Genome>,
        avg_fitness: f32,
        rng: &mut R,
    ) -> Result<(), EvolutionError> {
        if current.is_empty() {
            return Err(EvolutionError::EmptyPopulation);
        }

        next.clear();

        let mut order: Vec<usize> = (0..current.len()).collect();
        order.sort_by_key(|&i| Reverse(OrderedFloat(current[i].fitness)));

        let elite_count = ((current.len() as f32 * self.config.elitism_fraction).floor()
            as usize)
            .clamp(1, current.len());
        for &i in order.iter().take(elite_count) {
            next.push(Genome {
                genes: current[i].genes.clone(),
                fitness: 0.0,
            });
        }

        // Degenerate all-zero fitness collapses to uniform selection via the
        // floor; never an error.
        let normalizer = if avg_fitness > FITNESS_FLOOR {
            avg_fitness
        } else {
            1.0
        };
        let weights: Vec<f32> = current
            .iter()
            .map(|genome| (genome.fitness / normalizer).max(FITNESS_FLOOR))
            .collect();
        let total: f32 = weights.iter().sum();

        while next.len() < current.len() {
            let parent = &current[roulette(&weights, total, rng)];
            let mut genes = if rng.random::<f32>() < self.config.crossover_rate {
                let other = &current[roulette(&weights, total, rng)];
                if parent.genes.len() == other.genes.len() {
                    parent
                        .genes
                        .iter()
                        .zip(&other.genes)
                        .map(|(&a, &b)| if rng.random::<bool>() { a } else { b })
                        .collect()
                } else {
                    warn!(
                        left = parent.genes.len(),
                        right = other.genes.len(),
                        "crossover parents disagree on gene count; copying one parent"
                    );
                    parent.genes.clone()
                }
            } else {
                parent.genes.clone()
            };
            self.mutate(&mut genes, rng);
            next.push(Genome {
                genes,
                fitness: 0.0,
            });
        }

        Ok(())
    }

    /// Independently perturb each gene with probability `mutation_rate`.
    fn mutate<R: Rng>(&self, genes: &mut [f32], rng: &mut R) {
        let rate = self.config.mutation_rate;
        let max_change = self.config.mutation_max_change;
        if rate <= 0.0 || max_change <= 0.0 {
            return;
        }
        for gene in genes {
            if rng.random::<f32>() < rate {
                *gene += rng.random_range(-max_change..=max_change);
            }
        }
    }
}

/// Fitness-proportionate pick over precomputed weights.
fn roulette<R: Rng>(weights: &[f32], total: f32, rng: &mut R) -> usize {
    let pick = rng.random::<f32>() * total;
    let mut accum = 0.0;
    for (index, weight) in weights.iter().enumerate() {
        accum += weight;
        if accum >= pick {
            return index;
        }
    }
    weights.len() - 1
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// One evolvable vehicle: controller, sensor rig, and progress state.
pub struct Agent {
    controller: Box<dyn Controller>,
    sensors: Vec<SensorRay>,
    progress: ProgressState,
}

impl Agent {
    #[must_use]
    pub fn controller(&self) -> &dyn Controller {
        self.controller.as_ref()
    }

    /// Mutable controller access, e.g. to feed input events into the manual
    /// variant via `as_any_mut`.
    pub fn controller_mut(&mut self) -> &mut dyn Controller {
        self.controller.as_mut()
    }

    #[must_use]
    pub fn sensors(&self) -> &[SensorRay] {
        &self.sensors
    }

    #[must_use]
    pub const fn progress(&self) -> &ProgressState {
        &self.progress
    }
}

/// Summary of one completed generation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationSummary {
    pub generation: u32,
    /// Best track distance achieved by any evolved agent.
    pub best_fitness: f32,
    /// Population-average fitness snapshot used for selection normalization.
    pub avg_fitness: f32,
}

/// Outcome of one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickEvents {
    pub tick: u64,
    /// Agents still alive after this tick's kill checks.
    pub alive: usize,
    /// Present when this tick ended a generation.
    pub generation: Option<GenerationSummary>,
}

/// Aggregate simulation state: population, track, evolution engine, and the
/// physics collaborator seam.
pub struct World {
    config: WorldConfig,
    track: Track,
    physics: Box<dyn PhysicsWorld>,
    agents: Vec<Agent>,
    genomes: Vec<Genome>,
    genomes_next: Vec<Genome>,
    evolution: EvolutionEngine,
    rng: SmallRng,
    tick: u64,
    time: f64,
    generation: u32,
    history: VecDeque<GenerationSummary>,
    sensor_scratch: Vec<f32>,
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("generation", &self.generation)
            .field("agent_count", &self.agents.len())
            .finish()
    }
}

impl World {
    /// Instantiate a world over a loaded track and a physics backend.
    pub fn new(
        config: WorldConfig,
        track: Track,
        physics: Box<dyn PhysicsWorld>,
    ) -> Result<Self, WorldError> {
        config.validate()?;
        let rng = config.seeded_rng();
        let history_capacity = config.history_capacity;
        let population_size = config.population_size;
        let evolution = EvolutionEngine::new(config.evolution);
        Ok(Self {
            config,
            track,
            physics,
            agents: Vec::with_capacity(population_size),
            genomes: Vec::new(),
            genomes_next: Vec::new(),
            evolution,
            rng,
            tick: 0,
            time: 0.0,
            generation: 0,
            history: VecDeque::with_capacity(history_capacity),
            sensor_scratch: Vec::new(),
        })
    }

    /// Add one vehicle with the shared sensor rig and the given controller
    /// variant. Returns its index. The population is capped at the
    /// configured size.
    pub fn spawn_agent(
        &mut self,
        controller: Box<dyn Controller>,
    ) -> Result<usize, WorldError> {
        if self.agents.len() == self.config.population_size {
            return Err(WorldError::PopulationFull {
                capacity: self.config.population_size,
            });
        }
        let sensors = self
            .config
            .sensors
            .iter()
            .map(|mount| SensorRay::new(*mount))
            .collect();
        self.agents.push(Agent {
            controller,
            sensors,
            progress: ProgressState::new(self.time),
        });
        Ok(self.agents.len() - 1)
    }

    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    #[must_use]
    pub fn alive_count(&self) -> usize {
        self.agents
            .iter()
            .filter(|agent| agent.progress.alive)
            .count()
    }

    #[must_use]
    pub fn agent(&self, index: usize) -> Option<&Agent> {
        self.agents.get(index)
    }

    pub fn agent_mut(&mut self, index: usize) -> Option<&mut Agent> {
        self.agents.get_mut(index)
    }

    #[must_use]
    pub const fn config(&self) -> &WorldConfig {
        &self.config
    }

    #[must_use]
    pub const fn track(&self) -> &Track {
        &self.track
    }

    #[must_use]
    pub const fn tick(&self) -> u64 {
        self.tick
    }

    /// Simulation time in seconds, accumulated from `step` deltas.
    #[must_use]
    pub const fn time(&self) -> f64 {
        self.time
    }

    /// Completed generation count.
    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    #[must_use]
    pub const fn history(&self) -> &VecDeque<GenerationSummary> {
        &self.history
    }

    #[must_use]
    pub const fn evolution(&self) -> &EvolutionEngine {
        &self.evolution
    }

    /// Live access to the evolution tunables.
    pub fn evolution_mut(&mut self) -> &mut EvolutionEngine {
        &mut self.evolution
    }

    /// Kill one agent, e.g. on a chassis/terrain contact reported by the
    /// physics layer. Idempotent.
    pub fn kill(&mut self, index: usize) {
        if let Some(agent) = self.agents.get_mut(index) {
            agent.progress.kill();
        }
    }

    /// Restore one agent to its initial progress state, clear its sensors,
    /// and respawn its rigid body.
    pub fn reset_agent(&mut self, index: usize) {
        let now = self.time;
        if let Some(agent) = self.agents.get_mut(index) {
            agent.progress.reset(now);
            agent.controller.reset();
            for ray in &mut agent.sensors {
                ray.reset();
            }
            self.physics.reset_vehicle(index);
        }
    }

    /// Swap the active controller variant of one agent.
    pub fn replace_controller(&mut self, index: usize, controller: Box<dyn Controller>) {
        if let Some(agent) = self.agents.get_mut(index) {
            agent.controller = controller;
        }
    }

    /// Index of the living agent with the highest current track distance,
    /// e.g. for a follow camera.
    #[must_use]
    pub fn best_agent(&self) -> Option<usize> {
        self.agents
            .iter()
            .enumerate()
            .filter(|(_, agent)| agent.progress.alive)
            .max_by_key(|(_, agent)| OrderedFloat(agent.progress.current_distance))
            .map(|(index, _)| index)
    }

    /// Advance the whole population by one tick of `dt` seconds.
    ///
    /// The physics world itself is stepped by the orchestrator before this
    /// call; this refreshes perception, updates track progress and kill
    /// state, and hands each living agent's actuation to the physics
    /// collaborator. When no agent remains alive the generation transition
    /// runs before returning.
    pub fn step(&mut self, dt: f64) -> TickEvents {
        self.tick += 1;
        self.time += dt;

        let mut alive = 0;
        for index in 0..self.agents.len() {
            if !self.agents[index].progress.alive {
                continue;
            }

            let pose = self.physics.pose(index);
            let velocity = self.physics.velocity(index);

            let agent = &mut self.agents[index];
            for ray in &mut agent.sensors {
                ray.refresh(&pose);
                let hit = self.physics.cast_ray(index, ray.start_world(), ray.end_world());
                ray.observe_hit(hit);
            }

            if let Some(projection) = self.track.project(pose.position) {
                agent
                    .progress
                    .observe(&projection, velocity, self.config.velocity_epsilon);
            }

            if agent.progress.off_course()
                || agent.progress.wrong_direction()
                || agent.progress.stalled(
                    self.time,
                    self.config.stall_timeout_secs,
                    self.config.min_progress_segment,
                )
            {
                agent.progress.kill();
            }

            if !agent.progress.alive {
                continue;
            }
            alive += 1;

            self.sensor_scratch.clear();
            self.sensor_scratch
                .extend(agent.sensors.iter().map(SensorRay::distance));
            if let Some(actuation) = agent.controller.actuate(dt, &self.sensor_scratch) {
                self.physics.apply_actuation(index, actuation);
            }
        }

        let generation = if alive == 0 && !self.agents.is_empty() {
            Some(self.advance_generation())
        } else {
            None
        };

        TickEvents {
            tick: self.tick,
            alive,
            generation,
        }
    }

    /// Stop-the-world generation transition: harvest genomes and fitness,
    /// evolve, write the next genes back, and reset the population. Runs to
    /// completion before the next tick; no partial swap is observable.
    fn advance_generation(&mut self) -> GenerationSummary {
        self.genomes.clear();
        let mut evolvable = Vec::new();
        for (index, agent) in self.agents.iter().enumerate() {
            if let Some(genes) = agent.controller.genome() {
                evolvable.push(index);
                self.genomes.push(Genome {
                    genes,
                    fitness: agent.progress.best_distance,
                });
            }
        }

        let best_fitness = self
            .genomes
            .iter()
            .map(|genome| genome.fitness)
            .fold(0.0, f32::max);
        let avg_fitness = if self.genomes.is_empty() {
            0.0
        } else {
            self.genomes.iter().map(|genome| genome.fitness).sum::<f32>()
                / self.genomes.len() as f32
        };

        if !self.genomes.is_empty() {
            match self.evolution.evolve(
                &self.genomes,
                &mut self.genomes_next,
                avg_fitness,
                &mut self.rng,
            ) {
                Ok(()) => {
                    mem::swap(&mut self.genomes, &mut self.genomes_next);
                    for (slot, &index) in evolvable.iter().enumerate() {
                        if let Err(err) = self.agents[index]
                            .controller
                            .apply_genome(&self.genomes[slot].genes)
                        {
                            warn!(agent = index, %err, "skipping gene transfer");
                        }
                    }
                }
                Err(err) => warn!(%err, "generation transition aborted"),
            }
        }

        self.generation += 1;
        for index in 0..self.agents.len() {
            self.reset_agent(index);
        }

        let summary = GenerationSummary {
            generation: self.generation,
            best_fitness,
            avg_fitness,
        };
        debug!(
            generation = summary.generation,
            best = summary.best_fitness,
            avg = summary.avg_fitness,
            "generation complete"
        );
        if self.history.len() == self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
        summary
    }
}
