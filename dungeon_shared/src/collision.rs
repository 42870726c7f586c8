//! Tile-grid collision world.
//!
//! Maps are plain ASCII: `#` is a wall, `S` marks a spawn point, anything else
//! is floor. Both server and client build the same grid (the server ships the
//! rows in `MapInfo`) so predicted and authoritative collisions agree.
//!
//! # Usage
//! ```ignore
//! let grid = TileGrid::load("maps/crypt.txt", 32.0)?;
//! let blocked = grid.check_collision(Vec2::new(40.0, 40.0), 12.0);
//! ```

use std::path::Path;

use anyhow::{bail, Context};
use tracing::debug;

use crate::{math::Vec2, movement::CollisionWorld};

/// Default tile edge length in pixels.
pub const DEFAULT_TILE_SIZE: f32 = 32.0;

const WALL: char = '#';
const SPAWN: char = 'S';

/// Solid/empty tile grid.
#[derive(Debug, Clone, PartialEq)]
pub struct TileGrid {
    pub name: String,
    pub tile_size: f32,
    width: usize,
    height: usize,
    solid: Vec<bool>,
    spawns: Vec<(usize, usize)>,
}

impl TileGrid {
    /// Parses a grid from ASCII rows. All rows must have the same width.
    pub fn from_rows<S: AsRef<str>>(
        name: impl Into<String>,
        rows: &[S],
        tile_size: f32,
    ) -> anyhow::Result<Self> {
        if rows.is_empty() {
            bail!("map has no rows");
        }
        if !(tile_size > 0.0) {
            bail!("tile size must be positive, got {tile_size}");
        }
        let width = rows[0].as_ref().chars().count();
        if width == 0 {
            bail!("map rows are empty");
        }

        let mut solid = Vec::with_capacity(width * rows.len());
        let mut spawns = Vec::new();
        for (y, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            let n = row.chars().count();
            if n != width {
                bail!("row {y} has width {n}, expected {width}");
            }
            for (x, c) in row.chars().enumerate() {
                solid.push(c == WALL);
                if c == SPAWN {
                    spawns.push((x, y));
                }
            }
        }

        Ok(Self {
            name: name.into(),
            tile_size,
            width,
            height: rows.len(),
            solid,
            spawns,
        })
    }

    /// Loads a grid from a text file; the map name is the file stem.
    pub fn load<P: AsRef<Path>>(path: P, tile_size: f32) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();
        let text =
            std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let rows: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        let grid = Self::from_rows(name, &rows, tile_size)
            .with_context(|| format!("parse {}", path.display()))?;
        debug!(path = %path.display(), width = grid.width, height = grid.height, "Map file loaded");
        Ok(grid)
    }

    /// Walled rectangular room with a spawn in the middle.
    pub fn arena(width: usize, height: usize) -> Self {
        let width = width.max(3);
        let height = height.max(3);
        let rows: Vec<String> = (0..height)
            .map(|y| {
                (0..width)
                    .map(|x| {
                        if x == 0 || y == 0 || x == width - 1 || y == height - 1 {
                            WALL
                        } else if x == width / 2 && y == height / 2 {
                            SPAWN
                        } else {
                            '.'
                        }
                    })
                    .collect()
            })
            .collect();
        let mut solid = Vec::with_capacity(width * height);
        for row in &rows {
            solid.extend(row.chars().map(|c| c == WALL));
        }
        Self {
            name: "arena".to_string(),
            tile_size: DEFAULT_TILE_SIZE,
            width,
            height,
            solid,
            spawns: vec![(width / 2, height / 2)],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Re-encodes the grid as ASCII rows (for `MapInfo`).
    pub fn rows(&self) -> Vec<String> {
        (0..self.height)
            .map(|y| {
                (0..self.width)
                    .map(|x| {
                        if self.solid[y * self.width + x] {
                            WALL
                        } else if self.spawns.contains(&(x, y)) {
                            SPAWN
                        } else {
                            '.'
                        }
                    })
                    .collect()
            })
            .collect()
    }

    /// Out-of-bounds tiles count as solid.
    pub fn is_solid(&self, tx: i64, ty: i64) -> bool {
        if tx < 0 || ty < 0 || tx >= self.width as i64 || ty >= self.height as i64 {
            return true;
        }
        self.solid[ty as usize * self.width + tx as usize]
    }

    /// World-space centre of a tile.
    pub fn tile_center(&self, tx: usize, ty: usize) -> Vec2 {
        Vec2::new(
            (tx as f32 + 0.5) * self.tile_size,
            (ty as f32 + 0.5) * self.tile_size,
        )
    }

    /// Spawn points, falling back to the first floor tile.
    pub fn spawn_points(&self) -> Vec<Vec2> {
        if !self.spawns.is_empty() {
            return self
                .spawns
                .iter()
                .map(|&(x, y)| self.tile_center(x, y))
                .collect();
        }
        self.solid
            .iter()
            .position(|s| !s)
            .map(|i| vec![self.tile_center(i % self.width, i / self.width)])
            .unwrap_or_default()
    }
}

impl CollisionWorld for TileGrid {
    fn check_collision(&self, at: Vec2, radius: f32) -> bool {
        let ts = self.tile_size;
        let min_x = ((at.x - radius) / ts).floor() as i64;
        let max_x = ((at.x + radius) / ts).floor() as i64;
        let min_y = ((at.y - radius) / ts).floor() as i64;
        let max_y = ((at.y + radius) / ts).floor() as i64;

        for ty in min_y..=max_y {
            for tx in min_x..=max_x {
                if !self.is_solid(tx, ty) {
                    continue;
                }
                // Closest point of the tile rectangle to the circle centre.
                let left = tx as f32 * ts;
                let top = ty as f32 * ts;
                let closest = Vec2::new(at.x.clamp(left, left + ts), at.y.clamp(top, top + ts));
                if closest.distance(at) < radius {
                    return true;
                }
            }
        }
        false
    }
}
