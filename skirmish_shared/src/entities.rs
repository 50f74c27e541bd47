//! Game content: the walking entity state and the two concrete kinds.

use rand::Rng;

use crate::{
    codec::{ByteStream, MAX_STRING_LEN},
    entity::{Entity, EntityCore, EntityKind, EntityRegistry},
    entity_any,
    error::{CodecError, EntityError},
    math::{normalize_angle, smooth_angle, to_radians, Vec2},
    packets::MAX_USERNAME_LEN,
    world::TickContext,
};

pub const PLAYER_TYPE_ID: u16 = 0;
pub const ZOMBIE_TYPE_ID: u16 = 1;

const PLAYER_SIZE: Vec2 = Vec2::new(32.0, 32.0);
const PLAYER_MAX_HEALTH: u32 = 100;
const PLAYER_SPEED: f32 = 2.0;

const ZOMBIE_SIZE: Vec2 = Vec2::new(32.0, 32.0);
const ZOMBIE_MAX_HEALTH: u32 = 100;
const ZOMBIE_SPEED: f32 = 0.75;
/// Ticks between two random turns.
const ZOMBIE_TURN_INTERVAL: u64 = 60;
/// Degrees per tick.
const ZOMBIE_TURN_SPEED: f32 = 1.5;

/// Movement state of an entity that walks. Angles are radians.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Living {
    pub default_speed: f32,
    pub current_speed: f32,
    pub head_angle: f32,
    pub move_angle: f32,
    pub strafe_angle: f32,
}

impl Living {
    pub fn with_speed(default_speed: f32) -> Self {
        Self {
            default_speed,
            ..Self::default()
        }
    }

    pub fn is_moving(&self) -> bool {
        self.current_speed > 0.0
    }

    /// Starts walking at the default speed.
    pub fn start(&mut self) {
        self.current_speed = self.default_speed;
    }

    pub fn stop(&mut self) {
        self.current_speed = 0.0;
    }

    pub fn set_moving(&mut self, moving: bool) {
        if moving {
            self.start();
        } else {
            self.stop();
        }
    }

    /// Direction of travel: the move angle plus the strafe offset.
    pub fn heading(&self) -> f32 {
        normalize_angle(self.move_angle + self.strafe_angle)
    }

    /// Advances `core` along the heading by `current_speed * delta`.
    pub fn step(&self, core: &mut EntityCore, delta: f32) {
        if !self.is_moving() {
            return;
        }
        let offset = Vec2::from_angle(self.heading()) * (self.current_speed * delta);
        core.set_position(core.position() + offset);
    }

    pub fn read_data(&mut self, input: &mut ByteStream) -> Result<(), CodecError> {
        self.default_speed = input.read_f32()?;
        self.current_speed = input.read_f32()?;
        self.head_angle = input.read_f32()?;
        self.strafe_angle = input.read_f32()?;
        Ok(())
    }

    pub fn write_data(&self, out: &mut ByteStream) {
        out.write_f32(self.default_speed);
        out.write_f32(self.current_speed);
        out.write_f32(self.head_angle);
        out.write_f32(self.strafe_angle);
    }
}

/// Trims and shortens a requested username.
pub fn sanitize_username(raw: &str) -> String {
    raw.trim().chars().take(MAX_USERNAME_LEN).collect()
}

/// Entity controlled by a connected client.
#[derive(Debug)]
pub struct Player {
    pub core: EntityCore,
    pub living: Living,
    username: String,
}

impl Default for Player {
    fn default() -> Self {
        Self {
            core: EntityCore::new(PLAYER_SIZE, PLAYER_MAX_HEALTH),
            living: Living::with_speed(PLAYER_SPEED),
            username: String::new(),
        }
    }
}

impl Player {
    pub fn with_username(username: &str) -> Self {
        Self {
            username: sanitize_username(username),
            ..Self::default()
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl Entity for Player {
    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    fn tick(&mut self, delta: f32, _ctx: &mut TickContext<'_>) {
        self.living.step(&mut self.core, delta);
    }

    fn read_data(&mut self, input: &mut ByteStream) -> Result<(), EntityError> {
        self.living.read_data(input)?;
        self.username = input.read_string(MAX_STRING_LEN)?;
        Ok(())
    }

    fn write_data(&self, out: &mut ByteStream) -> Result<(), EntityError> {
        self.living.write_data(out);
        out.write_string(&self.username)?;
        Ok(())
    }

    fn living(&self) -> Option<&Living> {
        Some(&self.living)
    }

    fn living_mut(&mut self) -> Option<&mut Living> {
        Some(&mut self.living)
    }

    entity_any!();
}

impl EntityKind for Player {
    const TYPE_ID: Option<u16> = Some(PLAYER_TYPE_ID);
}

/// Wanders in slowly drifting circles.
#[derive(Debug)]
pub struct Zombie {
    pub core: EntityCore,
    pub living: Living,
    target_angle: f32,
}

impl Default for Zombie {
    fn default() -> Self {
        Self {
            core: EntityCore::new(ZOMBIE_SIZE, ZOMBIE_MAX_HEALTH),
            living: Living::with_speed(ZOMBIE_SPEED),
            target_angle: 0.0,
        }
    }
}

impl Zombie {
    pub fn at(position: Vec2) -> Self {
        let mut zombie = Self::default();
        zombie.core.set_position(position);
        zombie
    }

    pub fn target_angle(&self) -> f32 {
        self.target_angle
    }
}

impl Entity for Zombie {
    fn core(&self) -> &EntityCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    fn tick(&mut self, delta: f32, ctx: &mut TickContext<'_>) {
        self.living.step(&mut self.core, delta);

        if ctx.ticks() % ZOMBIE_TURN_INTERVAL == 0 {
            let turn: f32 = ctx.rng().gen_range(-20.0..40.0);
            self.target_angle = normalize_angle(self.target_angle + to_radians(turn));
        }

        let speed = to_radians(ZOMBIE_TURN_SPEED);
        self.living.head_angle = smooth_angle(self.living.head_angle, self.target_angle, speed);
        self.living.move_angle = smooth_angle(self.living.move_angle, self.target_angle, speed);
        self.living.start();
    }

    fn read_data(&mut self, input: &mut ByteStream) -> Result<(), EntityError> {
        self.living.read_data(input)?;
        Ok(())
    }

    fn write_data(&self, out: &mut ByteStream) -> Result<(), EntityError> {
        self.living.write_data(out);
        Ok(())
    }

    fn living(&self) -> Option<&Living> {
        Some(&self.living)
    }

    fn living_mut(&mut self) -> Option<&mut Living> {
        Some(&mut self.living)
    }

    entity_any!();
}

impl EntityKind for Zombie {
    const TYPE_ID: Option<u16> = Some(ZOMBIE_TYPE_ID);
}

/// Installs the game's entity kinds.
pub fn register_standard_entities(registry: &mut EntityRegistry) -> Result<(), EntityError> {
    registry.register::<Player>()?;
    registry.register::<Zombie>()?;
    Ok(())
}
