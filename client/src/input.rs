//! Keyboard sampling into movement controls and one-shot actions

use crate::actor::Controls;
use macroquad::prelude::*;

/// One frame worth of input.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InputFrame {
    pub controls: Controls,
    pub controls_changed: bool,
    pub fire: bool,
    pub dash: bool,
    /// P toggles leaving the room without closing the window.
    pub toggle_away: bool,
}

/// Samples held keys every frame and turns X/Z/P presses into edge events
pub struct InputManager {
    prev_fire: bool,
    prev_dash: bool,
    prev_away: bool,
    last_controls: Controls,
}

impl InputManager {
    pub fn new() -> Self {
        Self {
            prev_fire: false,
            prev_dash: false,
            prev_away: false,
            last_controls: Controls::default(),
        }
    }

    pub fn update(&mut self) -> InputFrame {
        let forward = axis(
            is_key_down(KeyCode::W) || is_key_down(KeyCode::Up),
            is_key_down(KeyCode::S) || is_key_down(KeyCode::Down),
        );
        let turn = axis(
            is_key_down(KeyCode::D) || is_key_down(KeyCode::Right),
            is_key_down(KeyCode::A) || is_key_down(KeyCode::Left),
        );
        let up = axis(
            is_key_down(KeyCode::Space),
            is_key_down(KeyCode::LeftShift) || is_key_down(KeyCode::RightShift),
        );

        let fire = is_key_down(KeyCode::X);
        let dash = is_key_down(KeyCode::Z);
        let away = is_key_down(KeyCode::P);

        self.edges(Controls { forward, turn, up }, fire, dash, away)
    }

    /// Pure part of `update`: pressed-this-frame detection.
    fn edges(&mut self, controls: Controls, fire: bool, dash: bool, away: bool) -> InputFrame {
        let frame = InputFrame {
            controls,
            controls_changed: controls != self.last_controls,
            fire: fire && !self.prev_fire,
            dash: dash && !self.prev_dash,
            toggle_away: away && !self.prev_away,
        };

        self.prev_fire = fire;
        self.prev_dash = dash;
        self.prev_away = away;
        self.last_controls = controls;
        frame
    }

    pub fn current_controls(&self) -> Controls {
        self.last_controls
    }
}

impl Default for InputManager {
    fn default() -> Self {
        Self::new()
    }
}

fn axis(positive: bool, negative: bool) -> f32 {
    match (positive, negative) {
        (true, false) => 1.0,
        (false, true) => -1.0,
        _ => 0.0,
    }
}
