// src/env/pinpad.rs
//
// PinPad with dense guidance rewards.
//
// A 16x14 room with coloured pads; the agent must visit the pads in
// ascending order. Shaping toward the next pad:
//   +0.1 moving closer, -0.05 moving away,
//   -0.1 stepping on a wrong pad, +1.0 stepping on the correct pad.
// Completing the sequence pays +10 and starts a 10-step countdown after
// which the agent respawns with an empty sequence.

use std::collections::VecDeque;
use std::str::FromStr;

use ndarray::Array3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::{Env, EnvStep};
use crate::error::HierosError;

pub const WIDTH: usize = 16;
pub const HEIGHT: usize = 14;
const SCALE: usize = 4;

const MOVE_TOWARD_REWARD: f32 = 0.1;
const MOVE_AWAY_PENALTY: f32 = 0.05;
const WRONG_TILE_PENALTY: f32 = 0.1;
const CORRECT_TILE_BONUS: f32 = 1.0;
const SEQUENCE_REWARD: f32 = 10.0;
const COUNTDOWN: u32 = 10;

const WALL_COLOR: [u8; 3] = [192, 192, 192];

/// noop, +y, -y, +x, -x
const MOVES: [(i64, i64); 5] = [(0, 0), (0, 1), (0, -1), (1, 0), (-1, 0)];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinPadLayout {
    Three,
    Four,
    Five,
    Six,
    Seven,
    Eight,
}

impl FromStr for PinPadLayout {
    type Err = HierosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "three" => Ok(Self::Three),
            "four" => Ok(Self::Four),
            "five" => Ok(Self::Five),
            "six" => Ok(Self::Six),
            "seven" => Ok(Self::Seven),
            "eight" => Ok(Self::Eight),
            other => Err(HierosError::InvalidConfig(format!(
                "unknown pinpad layout '{other}' (expected three..eight)"
            ))),
        }
    }
}

impl PinPadLayout {
    fn rows(&self) -> &'static [&'static str; HEIGHT] {
        match self {
            Self::Three => &LAYOUT_THREE,
            Self::Four => &LAYOUT_FOUR,
            Self::Five => &LAYOUT_FIVE,
            Self::Six => &LAYOUT_SIX,
            Self::Seven => &LAYOUT_SEVEN,
            Self::Eight => &LAYOUT_EIGHT,
        }
    }
}

/// Visit statistics over non-wall cells.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionStats {
    pub total_visits: u64,
    pub unique_positions_visited: usize,
    pub total_valid_positions: usize,
    pub coverage_ratio: f64,
    pub max_visits_single_position: u64,
    pub mean_visits_per_visited_position: f64,
}

pub struct PinPadDense {
    /// `grid[x][y]`
    grid: [[u8; HEIGHT]; WIDTH],
    pads: Vec<u8>,
    pad_centers: Vec<(f64, f64)>,
    spawns: Vec<(usize, usize)>,
    length: u64,
    rng: ChaCha8Rng,
    sequence: VecDeque<u8>,
    player: (usize, usize),
    steps: u64,
    done: bool,
    countdown: u32,
    visits: [[u64; HEIGHT]; WIDTH],
}

impl PinPadDense {
    pub fn new(layout: PinPadLayout, length: u64, seed: u64) -> Result<Self, HierosError> {
        if length == 0 {
            return Err(HierosError::InvalidConfig(
                "env.length must be > 0".to_string(),
            ));
        }
        let mut grid = [[b' '; HEIGHT]; WIDTH];
        for (y, row) in layout.rows().iter().enumerate() {
            for (x, c) in row.bytes().enumerate() {
                grid[x][y] = c;
            }
        }
        let mut pads: Vec<u8> = grid
            .iter()
            .flatten()
            .copied()
            .filter(u8::is_ascii_digit)
            .collect();
        pads.sort_unstable();
        pads.dedup();

        let mut spawns = Vec::new();
        let mut sums = vec![(0.0, 0.0, 0usize); pads.len()];
        for (x, col) in grid.iter().enumerate() {
            for (y, c) in col.iter().enumerate() {
                if *c != b'#' {
                    spawns.push((x, y));
                }
                if let Some(i) = pads.iter().position(|p| p == c) {
                    sums[i].0 += x as f64;
                    sums[i].1 += y as f64;
                    sums[i].2 += 1;
                }
            }
        }
        let pad_centers = sums
            .iter()
            .map(|(sx, sy, n)| (sx / *n as f64, sy / *n as f64))
            .collect();

        tracing::debug!(
            sequence = %String::from_utf8_lossy(&pads),
            length,
            "created pinpad env"
        );
        Ok(Self {
            grid,
            sequence: VecDeque::with_capacity(pads.len()),
            pads,
            pad_centers,
            spawns,
            length,
            rng: ChaCha8Rng::seed_from_u64(seed),
            player: (0, 0),
            steps: 0,
            done: true,
            countdown: 0,
            visits: [[0; HEIGHT]; WIDTH],
        })
    }

    pub fn target(&self) -> &[u8] {
        &self.pads
    }

    pub fn player(&self) -> (usize, usize) {
        self.player
    }

    fn tile(&self, (x, y): (usize, usize)) -> u8 {
        self.grid[x][y]
    }

    fn is_pad(&self, tile: u8) -> bool {
        self.pads.contains(&tile)
    }

    fn spawn(&mut self) {
        self.player = self.spawns[self.rng.gen_range(0..self.spawns.len())];
        self.sequence.clear();
    }

    fn push_sequence(&mut self, tile: u8) {
        if self.sequence.back() != Some(&tile) {
            if self.sequence.len() == self.pads.len() {
                self.sequence.pop_front();
            }
            self.sequence.push_back(tile);
        }
    }

    /// Length of the longest suffix of the visited sequence that is a
    /// prefix of the target.
    fn progress(&self) -> usize {
        let seq: Vec<u8> = self.sequence.iter().copied().collect();
        (0..seq.len())
            .map(|start| &seq[start..])
            .find(|suffix| suffix.len() <= self.pads.len() && self.pads.starts_with(suffix))
            .map_or(0, |s| s.len())
    }

    fn dense_reward(&self, old: (usize, usize), new: (usize, usize), tile: u8) -> f32 {
        let next = self.progress();
        if next >= self.pads.len() {
            return 0.0;
        }
        let target = self.pads[next];
        let (cx, cy) = self.pad_centers[next];
        let dist =
            |(x, y): (usize, usize)| ((x as f64 - cx).powi(2) + (y as f64 - cy).powi(2)).sqrt();
        let (old_dist, new_dist) = (dist(old), dist(new));

        let mut reward = 0.0;
        if new_dist < old_dist {
            reward += MOVE_TOWARD_REWARD;
        } else if new_dist > old_dist {
            reward -= MOVE_AWAY_PENALTY;
        }
        if self.is_pad(tile) && tile != target {
            reward -= WRONG_TILE_PENALTY;
        }
        if tile == target {
            reward += CORRECT_TILE_BONUS;
        }
        reward
    }

    fn observe(&self, reward: f32, is_first: bool, is_last: bool) -> EnvStep {
        let mut obs = Vec::with_capacity(self.obs_dim());
        obs.push(self.player.0 as f32 / (WIDTH - 1) as f32);
        obs.push(self.player.1 as f32 / (HEIGHT - 1) as f32);
        let current = self.tile(self.player);
        obs.extend(self.pads.iter().map(|p| if *p == current { 1.0 } else { 0.0 }));
        obs.push(self.progress() as f32 / self.pads.len().max(1) as f32);
        obs.push(if self.countdown > 0 { 1.0 } else { 0.0 });
        EnvStep {
            obs,
            reward,
            is_first,
            is_last,
            is_terminal: false,
        }
    }

    /// 64x64 RGB frame: room, pads (highlighted when occupied), player in
    /// black, and the visited sequence in the bottom status rows.
    pub fn render(&self) -> Array3<u8> {
        let mut cells = [[[255u8; 3]; WIDTH]; WIDTH];
        if self.countdown > 0 {
            for row in cells.iter_mut() {
                row.fill([223, 255, 223]);
            }
        }
        let current = self.tile(self.player);
        for x in 0..WIDTH {
            for y in 0..HEIGHT {
                let c = self.grid[x][y];
                if c == b'#' {
                    cells[x][y] = WALL_COLOR;
                } else if let Some(color) = pad_color(c) {
                    cells[x][y] = if c == current {
                        color
                    } else {
                        color.map(|v| ((10 * v as u32 + 90 * 255) / 100) as u8)
                    };
                }
            }
        }
        cells[self.player.0][self.player.1] = [0, 0, 0];
        for col in cells.iter_mut() {
            col[WIDTH - 2] = WALL_COLOR;
            col[WIDTH - 1] = WALL_COLOR;
        }
        for (i, c) in self.sequence.iter().enumerate() {
            if let Some(color) = pad_color(*c) {
                cells[2 * i + 1][WIDTH - 2] = color;
            }
        }
        upscale(WIDTH, WIDTH, |x, y| cells[x][y])
    }

    /// Visit heatmap: `[56, 64, 3]` (14 rows x 16 columns, 4x upscaled).
    /// Blue -> green -> yellow -> red by visits relative to the maximum;
    /// walls grey.
    pub fn position_heatmap(&self) -> Array3<u8> {
        let max = self.visits.iter().flatten().copied().max().unwrap_or(0);
        upscale(WIDTH, HEIGHT, |x, y| {
            if self.grid[x][y] == b'#' {
                return WALL_COLOR;
            }
            let intensity = if max > 0 {
                self.visits[x][y] as f32 / max as f32
            } else {
                0.0
            };
            heat_color(intensity)
        })
    }

    pub fn stats(&self) -> PositionStats {
        let mut total_valid = 0;
        let mut visited = 0;
        let mut visited_sum = 0u64;
        for x in 0..WIDTH {
            for y in 0..HEIGHT {
                if self.grid[x][y] == b'#' {
                    continue;
                }
                total_valid += 1;
                if self.visits[x][y] > 0 {
                    visited += 1;
                    visited_sum += self.visits[x][y];
                }
            }
        }
        PositionStats {
            total_visits: self.visits.iter().flatten().sum(),
            unique_positions_visited: visited,
            total_valid_positions: total_valid,
            coverage_ratio: if total_valid > 0 {
                visited as f64 / total_valid as f64
            } else {
                0.0
            },
            max_visits_single_position: self.visits.iter().flatten().copied().max().unwrap_or(0),
            mean_visits_per_visited_position: if visited > 0 {
                visited_sum as f64 / visited as f64
            } else {
                0.0
            },
        }
    }
}

impl Env for PinPadDense {
    fn obs_dim(&self) -> usize {
        2 + self.pads.len() + 2
    }

    fn num_actions(&self) -> usize {
        MOVES.len()
    }

    fn reset(&mut self, seed: Option<u64>) -> EnvStep {
        if let Some(seed) = seed {
            self.rng = ChaCha8Rng::seed_from_u64(seed);
        }
        self.spawn();
        self.steps = 0;
        self.done = false;
        self.countdown = 0;
        self.observe(0.0, true, false)
    }

    fn step(&mut self, action: usize) -> EnvStep {
        if self.done {
            return self.reset(None);
        }
        if self.countdown > 0 {
            self.countdown -= 1;
            if self.countdown == 0 {
                self.spawn();
            }
        }

        let old = self.player;
        let (dx, dy) = MOVES[action.min(MOVES.len() - 1)];
        let x = (old.0 as i64 + dx).clamp(0, WIDTH as i64 - 1) as usize;
        let y = (old.1 as i64 + dy).clamp(0, HEIGHT as i64 - 1) as usize;
        let tile = self.tile((x, y));
        if tile != b'#' {
            self.player = (x, y);
            self.visits[x][y] += 1;
        }

        let mut reward = self.dense_reward(old, self.player, tile);
        if self.is_pad(tile) {
            self.push_sequence(tile);
        }
        if self.countdown == 0 && self.sequence.iter().eq(self.pads.iter()) {
            reward += SEQUENCE_REWARD;
            self.countdown = COUNTDOWN;
        }
        self.steps += 1;
        self.done = self.steps >= self.length;
        self.observe(reward, false, self.done)
    }

    fn position_stats(&self) -> Option<PositionStats> {
        Some(self.stats())
    }
}

fn pad_color(c: u8) -> Option<[u8; 3]> {
    Some(match c {
        b'1' => [255, 0, 0],
        b'2' => [0, 255, 0],
        b'3' => [0, 0, 255],
        b'4' => [255, 255, 0],
        b'5' => [255, 0, 255],
        b'6' => [0, 255, 255],
        b'7' => [128, 0, 128],
        b'8' => [0, 128, 128],
        _ => return None,
    })
}

fn heat_color(intensity: f32) -> [u8; 3] {
    let ch = |v: f32| (v * 4.0 * 255.0) as u8;
    if intensity < 0.25 {
        [0, ch(intensity), 255]
    } else if intensity < 0.5 {
        [0, 255, ch(0.5 - intensity)]
    } else if intensity < 0.75 {
        [ch(intensity - 0.5), 255, 0]
    } else {
        [255, ch(1.0 - intensity), 0]
    }
}

/// `[rows * 4, cols * 4, 3]` image where pixel (row, col) shows cell
/// `(col / 4, row / 4)`.
fn upscale(cols: usize, rows: usize, cell: impl Fn(usize, usize) -> [u8; 3]) -> Array3<u8> {
    Array3::from_shape_fn((rows * SCALE, cols * SCALE, 3), |(r, c, ch)| {
        cell(c / SCALE, r / SCALE)[ch]
    })
}

const LAYOUT_THREE: [&str; HEIGHT] = [
    "################",
    "#1111      3333#",
    "#1111      3333#",
    "#1111      3333#",
    "#1111      3333#",
    "#              #",
    "#              #",
    "#              #",
    "#              #",
    "#     2222     #",
    "#     2222     #",
    "#     2222     #",
    "#     2222     #",
    "################",
];

const LAYOUT_FOUR: [&str; HEIGHT] = [
    "################",
    "#1111      4444#",
    "#1111      4444#",
    "#1111      4444#",
    "#1111      4444#",
    "#              #",
    "#              #",
    "#              #",
    "#              #",
    "#3333      2222#",
    "#3333      2222#",
    "#3333      2222#",
    "#3333      2222#",
    "################",
];

const LAYOUT_FIVE: [&str; HEIGHT] = [
    "################",
    "#          4444#",
    "#111       4444#",
    "#111       4444#",
    "#111           #",
    "#111        555#",
    "#           555#",
    "#           555#",
    "#333        555#",
    "#333           #",
    "#333       2222#",
    "#333       2222#",
    "#          2222#",
    "################",
];

const LAYOUT_SIX: [&str; HEIGHT] = [
    "################",
    "#111        555#",
    "#111        555#",
    "#111        555#",
    "#              #",
    "#33          66#",
    "#33          66#",
    "#33          66#",
    "#33          66#",
    "#              #",
    "#444        222#",
    "#444        222#",
    "#444        222#",
    "################",
];

const LAYOUT_SEVEN: [&str; HEIGHT] = [
    "################",
    "#111        444#",
    "#111        444#",
    "#11          44#",
    "#              #",
    "#33          55#",
    "#33          55#",
    "#33          55#",
    "#33          55#",
    "#              #",
    "#66          22#",
    "#666  7777  222#",
    "#666  7777  222#",
    "################",
];

const LAYOUT_EIGHT: [&str; HEIGHT] = [
    "################",
    "#111  8888  444#",
    "#111  8888  444#",
    "#11          44#",
    "#              #",
    "#33          55#",
    "#33          55#",
    "#33          55#",
    "#33          55#",
    "#              #",
    "#66          22#",
    "#666  7777  222#",
    "#666  7777  222#",
    "################",
];

#[cfg(test)]
mod tests {
    use super::*;

    fn env(seed: u64) -> PinPadDense {
        PinPadDense::new(PinPadLayout::Three, 50, seed).unwrap()
    }

    #[test]
    fn test_layouts_parse() {
        for name in ["three", "four", "five", "six", "seven", "eight"] {
            let layout: PinPadLayout = name.parse().unwrap();
            let e = PinPadDense::new(layout, 10, 0).unwrap();
            assert!(e.target().len() >= 3);
            assert_eq!(e.target().windows(2).filter(|w| w[0] >= w[1]).count(), 0);
        }
        assert!("nine".parse::<PinPadLayout>().is_err());
    }

    #[test]
    fn test_reset_and_episode_length() {
        let mut e = env(1);
        let first = e.reset(None);
        assert!(first.is_first);
        assert_eq!(first.obs.len(), e.obs_dim());
        let mut last = None;
        for i in 0..50 {
            let s = e.step(i % 5);
            if s.is_last {
                last = Some(i);
            }
        }
        assert_eq!(last, Some(49));
        assert!(e.step(0).is_first);
    }

    #[test]
    fn test_same_seed_same_rollout() {
        let run = |seed| {
            let mut e = env(seed);
            let mut out = vec![e.reset(None)];
            out.extend((0..30).map(|i| e.step((i * 7) % 5)));
            out
        };
        assert_eq!(run(3), run(3));
    }

    #[test]
    fn test_dense_reward_toward_pad_one() {
        let mut e = env(0);
        e.reset(None);
        // Next target is pad '1' centred at (2.5, 2.5); stand right of it.
        e.player = (8, 3);
        let s = e.step(4); // -x
        assert!((s.reward - MOVE_TOWARD_REWARD).abs() < 1e-6);
        let s = e.step(3); // +x
        assert!((s.reward + MOVE_AWAY_PENALTY).abs() < 1e-6);
    }

    #[test]
    fn test_correct_and_wrong_pads() {
        let mut e = env(0);
        e.reset(None);
        e.player = (5, 2);
        // Step onto pad '1' at (4, 2): closer + correct pad.
        let s = e.step(4);
        assert!((s.reward - (MOVE_TOWARD_REWARD + CORRECT_TILE_BONUS)).abs() < 1e-6);

        let mut e = env(0);
        e.reset(None);
        // Pad '2' occupies x 6..=9, y 9..=12; target is still '1'.
        e.player = (6, 8);
        let s = e.step(1); // +y onto '2', further from '1'
        assert!((s.reward + MOVE_AWAY_PENALTY + WRONG_TILE_PENALTY).abs() < 1e-6);
    }

    #[test]
    fn test_sequence_completion_pays_and_counts_down() {
        let mut e = env(0);
        e.reset(None);
        e.sequence.extend([b'1', b'2']);
        // Pad '3' at x 11..=14, y 1..=4; step onto it from (10, 2).
        e.player = (10, 2);
        let s = e.step(3);
        assert!(s.reward >= SEQUENCE_REWARD);
        assert_eq!(e.countdown, COUNTDOWN);
        for _ in 0..COUNTDOWN {
            e.step(0);
        }
        assert!(e.sequence.is_empty() || e.countdown == 0);
    }

    #[test]
    fn test_walls_block_movement() {
        let mut e = env(0);
        e.reset(None);
        e.player = (1, 1);
        e.step(4);
        assert_eq!(e.player(), (1, 1));
    }

    #[test]
    fn test_render_and_heatmap_shapes() {
        let mut e = env(2);
        e.reset(None);
        assert_eq!(e.render().shape(), &[64, 64, 3]);
        for i in 0..40 {
            e.step(i % 5);
        }
        let heat = e.position_heatmap();
        assert_eq!(heat.shape(), &[56, 64, 3]);
        // Top-left corner is a wall.
        assert_eq!(heat[[0, 0, 0]], 192);
    }

    #[test]
    fn test_position_stats() {
        let mut e = env(4);
        e.reset(None);
        for i in 0..30 {
            e.step(i % 5);
        }
        let s = e.stats();
        assert_eq!(s.total_valid_positions, 14 * 12);
        assert!(s.unique_positions_visited >= 1);
        assert!(s.total_visits <= 30);
        assert!(s.coverage_ratio > 0.0 && s.coverage_ratio <= 1.0);
        assert!(s.mean_visits_per_visited_position >= 1.0);
    }

    #[test]
    fn test_heat_color_ramp() {
        assert_eq!(heat_color(0.0), [0, 0, 255]);
        assert_eq!(heat_color(1.0), [255, 0, 0]);
        assert_eq!(heat_color(0.5)[1], 255);
    }
}
