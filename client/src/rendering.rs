use crate::game::{ActorView, EntityKind, RenderSnapshot};
use crate::identity::normalize_hex_color;
use macroquad::prelude::*;
use shared::{Vec3, MAX_HEALTH, TERRAIN_SIZE};

const MAP_MARGIN: f32 = 20.0;
const BIRD_SIZE: f32 = 6.0;
const HEADING_LENGTH: f32 = 12.0;

/// Top-down view of the room: the terrain square with everything on it, plus a HUD.
pub struct Renderer {
    width: f32,
    height: f32,
}

impl Renderer {
    pub fn new(width: usize, height: usize) -> Self {
        Renderer {
            width: width as f32,
            height: height as f32,
        }
    }

    pub fn resize(&mut self, width: f32, height: f32) {
        self.width = width;
        self.height = height;
    }

    pub fn render(&mut self, snapshot: &RenderSnapshot) {
        clear_background(Color::from_rgba(26, 26, 26, 255));

        self.draw_terrain();

        for entity in &snapshot.entities {
            let (x, y) = self.world_to_screen(entity.position);
            match entity.kind {
                EntityKind::Chicken => draw_circle(x, y, 3.0, WHITE),
                EntityKind::GoldChicken => draw_circle(x, y, 4.0, GOLD),
                EntityKind::Rainbow => {
                    draw_circle(x, y, 7.0, MAGENTA);
                    draw_circle_lines(x, y, 9.0, 1.0, SKYBLUE);
                }
                EntityKind::Heart => draw_circle(x, y, 4.0, RED),
            }
        }

        for projectile in &snapshot.projectiles {
            let (x, y) = self.world_to_screen(projectile.position);
            let color = if projectile.owned { YELLOW } else { ORANGE };
            draw_circle(x, y, 2.0, color);
        }

        for remote in snapshot.remotes.iter().filter(|r| r.visible) {
            self.draw_bird(remote, false);
        }
        if snapshot.local.visible {
            self.draw_bird(&snapshot.local, true);
        }

        self.draw_hud(snapshot);
    }

    fn map_extent(&self) -> (f32, f32, f32) {
        let side = (self.width.min(self.height) - MAP_MARGIN * 2.0).max(1.0);
        let left = (self.width - side) / 2.0;
        let top = (self.height - side) / 2.0;
        (left, top, side)
    }

    fn world_to_screen(&self, position: Vec3) -> (f32, f32) {
        let (left, top, side) = self.map_extent();
        map_to_screen(position, left, top, side)
    }

    fn draw_terrain(&mut self) {
        let (left, top, side) = self.map_extent();
        draw_rectangle(left, top, side, side, Color::from_rgba(34, 68, 34, 255));
        draw_rectangle_lines(left, top, side, side, 2.0, Color::from_rgba(68, 68, 68, 255));
    }

    fn draw_bird(&mut self, actor: &ActorView, is_local: bool) {
        let (x, y) = self.world_to_screen(actor.position);
        let color = parse_hex_color(&actor.color).unwrap_or(WHITE);

        draw_circle(x, y, BIRD_SIZE, color);
        if is_local {
            draw_circle_lines(x, y, BIRD_SIZE + 2.0, 2.0, WHITE);
        }

        // Screen y grows downwards while world z grows "north"
        let forward = Vec3::from_heading(actor.heading);
        draw_line(
            x,
            y,
            x + forward.x * HEADING_LENGTH,
            y - forward.z * HEADING_LENGTH,
            2.0,
            color,
        );

        draw_text(&actor.name, x + BIRD_SIZE + 2.0, y - BIRD_SIZE, 14.0, WHITE);
    }

    fn draw_hud(&mut self, snapshot: &RenderSnapshot) {
        let x = 10.0;
        let mut y = 20.0;

        for i in 0..MAX_HEALTH {
            let color = if i < snapshot.local.health {
                RED
            } else {
                Color::from_rgba(51, 51, 51, 255)
            };
            draw_rectangle(x + i as f32 * 14.0, y - 10.0, 12.0, 12.0, color);
        }
        y += 20.0;

        draw_text(&format!("Score {}", snapshot.local.score), x, y, 18.0, WHITE);
        y += 16.0;

        let dash_color = if snapshot.dashing { SKYBLUE } else { BLUE };
        draw_rectangle(x, y - 8.0, 80.0 * snapshot.dash_level, 6.0, dash_color);
        draw_rectangle_lines(x, y - 8.0, 80.0, 6.0, 1.0, WHITE);
        y += 18.0;

        let connection_color = if snapshot.online { GREEN } else { RED };
        draw_rectangle(x, y - 8.0, 8.0, 8.0, connection_color);
        draw_text(
            &format!("{} in room", snapshot.members),
            x + 12.0,
            y,
            14.0,
            WHITE,
        );
        y += 20.0;

        for (place, entry) in snapshot.ranking.iter().enumerate() {
            let color = if entry.is_local { YELLOW } else { WHITE };
            let line = format!("{}. {} {}", place + 1, entry.name, entry.score);
            draw_text(&line, x, y, 14.0, color);
            y += 14.0;
        }

        if !snapshot.local.visible {
            let text = "Shot down, respawning...";
            draw_text(text, self.width / 2.0 - 90.0, self.height / 2.0, 22.0, RED);
        }

        if let Some(notice) = &snapshot.notice {
            draw_text(notice, x, self.height - 12.0, 14.0, LIGHTGRAY);
        }
    }
}

/// Maps the world square onto a `side`-pixel square whose corner is at (`left`, `top`).
fn map_to_screen(position: Vec3, left: f32, top: f32, side: f32) -> (f32, f32) {
    let half = TERRAIN_SIZE / 2.0;
    let u = (position.x + half) / TERRAIN_SIZE;
    let v = (half - position.z) / TERRAIN_SIZE;
    (left + u * side, top + v * side)
}

/// `#rrggbb` or `#rgb` to a macroquad colour.
pub fn parse_hex_color(hex: &str) -> Option<Color> {
    let full = normalize_hex_color(hex)?;
    let digits = &full[1..];
    let channel = |range: std::ops::Range<usize>| u8::from_str_radix(&digits[range], 16).ok();
    Some(Color::from_rgba(channel(0..2)?, channel(2..4)?, channel(4..6)?, 255))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_parse_hex_color() {
        let color = parse_hex_color("#ff8000").unwrap();
        assert_approx_eq!(color.r, 1.0, 1e-6);
        assert_approx_eq!(color.g, 128.0 / 255.0, 1e-6);
        assert_approx_eq!(color.b, 0.0, 1e-6);

        let short = parse_hex_color("#f80").unwrap();
        assert_approx_eq!(short.r, 1.0, 1e-6);
        assert_approx_eq!(short.g, 136.0 / 255.0, 1e-6);
        assert_approx_eq!(short.b, 0.0, 1e-6);

        assert!(parse_hex_color("ff8000").is_none());
        assert!(parse_hex_color("#ff80").is_none());
        assert!(parse_hex_color("#gg0000").is_none());
    }

    #[test]
    fn test_map_corners() {
        let (x, y) = map_to_screen(Vec3::new(-500.0, 0.0, 500.0), 10.0, 20.0, 100.0);
        assert_approx_eq!(x, 10.0, 1e-4);
        assert_approx_eq!(y, 20.0, 1e-4);

        let (x, y) = map_to_screen(Vec3::new(0.0, 0.0, 0.0), 10.0, 20.0, 100.0);
        assert_approx_eq!(x, 60.0, 1e-4);
        assert_approx_eq!(y, 70.0, 1e-4);
    }
}
