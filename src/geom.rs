use std::ops::{Add, Sub};

#[cfg(feature = "python")]
use pyo3::pyclass;
use serde::{Serialize,Deserialize};

/// Zero-based pixel position, x = column and y = row.
#[derive(Clone,Debug,Copy,Deserialize,PartialEq,Serialize)]
#[cfg_attr(feature = "python", pyclass(get_all))]
pub struct Vec2D {
    pub x: f64,
    pub y: f64,
}

impl Add for Vec2D {
    fn add(self, rhs: Self) -> Self::Output {
        Self {
            x: self.x + rhs.x,
            y: self.y + rhs.y,
        }
    }
    type Output = Self;
}
impl Sub for Vec2D {
    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            x: self.x - rhs.x,
            y: self.y - rhs.y,
        }
    }
    type Output = Self;
}

impl Vec2D {
    pub fn norm(&self) -> f64 {
        self.x.hypot(self.y)
    }

    /// integer `[row, col]` index of the pixel containing this position
    pub fn pixel_index(&self) -> Option<[usize; 2]> {
        if self.x.is_finite() && self.y.is_finite() && self.x >= 0.0 && self.y >= 0.0 {
            Some([self.y as usize, self.x as usize])
        } else {
            None
        }
    }
}
