//! Geometric and auxiliary value types storable in attributes.
//!
//! All types here are plain copyable values with structural equality.
//! Components print space separated; [`Matrix4`] joins its four rows with
//! two spaces. Parsing accepts whitespace or commas between components.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Add, Div, Mul, Sub};
use std::str::FromStr;

use crate::error::{DmError, Result};

/// A raw byte payload attribute.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Binary(pub Vec<u8>);

impl Binary {
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Binary {
    fn from(data: Vec<u8>) -> Self {
        Self(data)
    }
}

/// An RGBA color with 8-bit channels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} {}", self.r, self.g, self.b, self.a)
    }
}

impl FromStr for Color {
    type Err = DmError;

    fn from_str(text: &str) -> Result<Self> {
        let mut parts = split_components(text);
        let mut next = || -> Result<u8> {
            parts
                .next()
                .ok_or_else(|| DmError::domain(format!("color needs 4 components, got \"{text}\"")))?
                .parse::<u8>()
                .map_err(|error| DmError::domain(format!("bad color component in \"{text}\": {error}")))
        };
        Ok(Self {
            r: next()?,
            g: next()?,
            b: next()?,
            a: next()?,
        })
    }
}

fn split_components(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| c.is_whitespace() || c == ',').filter(|part| !part.is_empty())
}

fn parse_floats(text: &str) -> Result<Vec<f32>> {
    split_components(text)
        .map(|part| {
            part.parse::<f32>()
                .map_err(|error| DmError::domain(format!("bad float component \"{part}\": {error}")))
        })
        .collect()
}

macro_rules! declare_vector {
    ($name:ident, $arity:expr, $($field:ident),+) => {
        #[derive(Clone, Copy, Debug, Default, PartialEq)]
        pub struct $name {
            $(pub $field: f32),+
        }

        impl $name {
            pub const ARITY: usize = $arity;

            pub fn new($($field: f32),+) -> Self {
                Self { $($field),+ }
            }

            /// Build from a float sequence, truncating extra components.
            /// Fails if the sequence runs short.
            pub fn from_floats<I: IntoIterator<Item = f32>>(floats: I) -> Result<Self> {
                let mut floats = floats.into_iter();
                $(
                    let $field = floats.next().ok_or_else(|| {
                        DmError::domain(concat!(stringify!($name), " needs ", stringify!($arity), " components"))
                    })?;
                )+
                Ok(Self { $($field),+ })
            }

            pub fn components(&self) -> [f32; $arity] {
                [$(self.$field),+]
            }

            pub fn length(&self) -> f32 {
                let mut sum = 0.0f32;
                $(sum += self.$field * self.$field;)+
                sum.sqrt()
            }

            /// Scale in place by the reciprocal of the length.
            pub fn normalise(&mut self) {
                let scale = 1.0 / self.length();
                $(self.$field *= scale;)+
            }

            pub fn normalised(mut self) -> Self {
                self.normalise();
                self
            }
        }

        impl Add for $name {
            type Output = Self;

            fn add(self, other: Self) -> Self {
                Self { $($field: self.$field + other.$field),+ }
            }
        }

        impl Sub for $name {
            type Output = Self;

            fn sub(self, other: Self) -> Self {
                Self { $($field: self.$field - other.$field),+ }
            }
        }

        impl Mul<f32> for $name {
            type Output = Self;

            fn mul(self, factor: f32) -> Self {
                Self { $($field: self.$field * factor),+ }
            }
        }

        impl Div<f32> for $name {
            type Output = Self;

            fn div(self, divisor: f32) -> Self {
                Self { $($field: self.$field / divisor),+ }
            }
        }

        // Components hash by XOR of their bit patterns. NaN payload bits
        // leak into the hash; accepted as-is.
        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                let mut bits = 0u32;
                $(bits ^= self.$field.to_bits();)+
                bits.hash(state);
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for (index, component) in self.components().iter().enumerate() {
                    if index != 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{component}")?;
                }
                Ok(())
            }
        }

        impl FromStr for $name {
            type Err = DmError;

            fn from_str(text: &str) -> Result<Self> {
                Self::from_floats(parse_floats(text)?)
            }
        }
    };
}

declare_vector!(Vector2, 2, x, y);
declare_vector!(Vector3, 3, x, y, z);
declare_vector!(Vector4, 4, x, y, z, w);
declare_vector!(Quaternion, 4, x, y, z, w);

/// Euler angles in degrees. Same shape as [`Vector3`] but a distinct
/// attribute kind on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Angle {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Angle {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn from_floats<I: IntoIterator<Item = f32>>(floats: I) -> Result<Self> {
        let vector = Vector3::from_floats(floats).map_err(|_| DmError::domain("Angle needs 3 components"))?;
        Ok(Self {
            x: vector.x,
            y: vector.y,
            z: vector.z,
        })
    }

    pub fn components(&self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }
}

impl Hash for Angle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.x.to_bits() ^ self.y.to_bits() ^ self.z.to_bits()).hash(state);
    }
}

impl fmt::Display for Angle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.x, self.y, self.z)
    }
}

impl FromStr for Angle {
    type Err = DmError;

    fn from_str(text: &str) -> Result<Self> {
        Self::from_floats(parse_floats(text)?)
    }
}

/// A row-major 4x4 float matrix.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Matrix4(pub [[f32; 4]; 4]);

impl Matrix4 {
    pub fn identity() -> Self {
        let mut rows = [[0.0; 4]; 4];
        for (index, row) in rows.iter_mut().enumerate() {
            row[index] = 1.0;
        }
        Self(rows)
    }

    /// Build from a 16-float sequence in row-major order, truncating extra
    /// components. Fails if the sequence runs short.
    pub fn from_floats<I: IntoIterator<Item = f32>>(floats: I) -> Result<Self> {
        let mut floats = floats.into_iter();
        let mut rows = [[0.0f32; 4]; 4];
        for row in &mut rows {
            for entry in row.iter_mut() {
                *entry = floats.next().ok_or_else(|| DmError::domain("Matrix4 needs 16 components"))?;
            }
        }
        Ok(Self(rows))
    }

    pub fn rows(&self) -> &[[f32; 4]; 4] {
        &self.0
    }

    pub fn components(&self) -> [f32; 16] {
        let mut all = [0.0; 16];
        for (index, entry) in self.0.iter().flatten().enumerate() {
            all[index] = *entry;
        }
        all
    }
}

impl Default for Matrix4 {
    fn default() -> Self {
        Self::identity()
    }
}

impl Hash for Matrix4 {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut bits = 0u32;
        for entry in self.0.iter().flatten() {
            bits ^= entry.to_bits();
        }
        bits.hash(state);
    }
}

impl fmt::Display for Matrix4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, row) in self.0.iter().enumerate() {
            if index != 0 {
                f.write_str("  ")?;
            }
            write!(f, "{} {} {} {}", row[0], row[1], row[2], row[3])?;
        }
        Ok(())
    }
}

impl FromStr for Matrix4 {
    type Err = DmError;

    fn from_str(text: &str) -> Result<Self> {
        Self::from_floats(parse_floats(text)?)
    }
}
