use std::collections::BTreeMap;

use crate::{Error, Field, Result};

/// One named channel of a [`Grid`].
#[derive(Debug, Clone)]
pub enum Channel {
    F32(Field<f32>),
    U32(Field<u32>),
    Bool(Field<bool>),
    Vec3(Field<[f32; 3]>),
}

impl Channel {
    fn dims(&self) -> (usize, usize) {
        match self {
            Channel::F32(f) => (f.width(), f.height()),
            Channel::U32(f) => (f.width(), f.height()),
            Channel::Bool(f) => (f.width(), f.height()),
            Channel::Vec3(f) => (f.width(), f.height()),
        }
    }
}

/// Tagged multi-channel grid container.
///
/// Stores an image, a disparity map, a validity mask and a needle map as
/// named channels over a single set of dimensions, so one structure can be
/// threaded through a whole experiment pipeline. All channels share the grid
/// size; adding a mismatched field is rejected.
#[derive(Debug, Clone)]
pub struct Grid {
    width: usize,
    height: usize,
    channels: BTreeMap<String, Channel>,
}

impl Grid {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            channels: BTreeMap::new(),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn add(&mut self, name: &str, channel: Channel) -> Result<()> {
        let (w, h) = channel.dims();
        if (w, h) != (self.width, self.height) {
            return Err(Error::DimensionMismatch(format!(
                "channel '{}' is {}x{}, grid is {}x{}",
                name, w, h, self.width, self.height
            )));
        }
        self.channels.insert(name.to_string(), channel);
        Ok(())
    }

    /// Adds a freshly zeroed f32 channel.
    pub fn add_f32(&mut self, name: &str) -> Result<()> {
        self.add(name, Channel::F32(Field::new(self.width, self.height)))
    }

    pub fn add_u32(&mut self, name: &str) -> Result<()> {
        self.add(name, Channel::U32(Field::new(self.width, self.height)))
    }

    pub fn add_bool(&mut self, name: &str) -> Result<()> {
        self.add(name, Channel::Bool(Field::new(self.width, self.height)))
    }

    pub fn add_vec3(&mut self, name: &str) -> Result<()> {
        self.add(name, Channel::Vec3(Field::new(self.width, self.height)))
    }

    pub fn remove(&mut self, name: &str) -> Option<Channel> {
        self.channels.remove(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(|s| s.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    pub fn field_f32(&self, name: &str) -> Result<&Field<f32>> {
        match self.channels.get(name) {
            Some(Channel::F32(f)) => Ok(f),
            Some(_) => Err(Error::TypeMismatch(name.to_string())),
            None => Err(Error::MissingChannel(name.to_string())),
        }
    }

    pub fn field_f32_mut(&mut self, name: &str) -> Result<&mut Field<f32>> {
        match self.channels.get_mut(name) {
            Some(Channel::F32(f)) => Ok(f),
            Some(_) => Err(Error::TypeMismatch(name.to_string())),
            None => Err(Error::MissingChannel(name.to_string())),
        }
    }

    pub fn field_u32(&self, name: &str) -> Result<&Field<u32>> {
        match self.channels.get(name) {
            Some(Channel::U32(f)) => Ok(f),
            Some(_) => Err(Error::TypeMismatch(name.to_string())),
            None => Err(Error::MissingChannel(name.to_string())),
        }
    }

    pub fn field_u32_mut(&mut self, name: &str) -> Result<&mut Field<u32>> {
        match self.channels.get_mut(name) {
            Some(Channel::U32(f)) => Ok(f),
            Some(_) => Err(Error::TypeMismatch(name.to_string())),
            None => Err(Error::MissingChannel(name.to_string())),
        }
    }

    pub fn field_bool(&self, name: &str) -> Result<&Field<bool>> {
        match self.channels.get(name) {
            Some(Channel::Bool(f)) => Ok(f),
            Some(_) => Err(Error::TypeMismatch(name.to_string())),
            None => Err(Error::MissingChannel(name.to_string())),
        }
    }

    pub fn field_bool_mut(&mut self, name: &str) -> Result<&mut Field<bool>> {
        match self.channels.get_mut(name) {
            Some(Channel::Bool(f)) => Ok(f),
            Some(_) => Err(Error::TypeMismatch(name.to_string())),
            None => Err(Error::MissingChannel(name.to_string())),
        }
    }

    pub fn field_vec3(&self, name: &str) -> Result<&Field<[f32; 3]>> {
        match self.channels.get(name) {
            Some(Channel::Vec3(f)) => Ok(f),
            Some(_) => Err(Error::TypeMismatch(name.to_string())),
            None => Err(Error::MissingChannel(name.to_string())),
        }
    }

    pub fn field_vec3_mut(&mut self, name: &str) -> Result<&mut Field<[f32; 3]>> {
        match self.channels.get_mut(name) {
            Some(Channel::Vec3(f)) => Ok(f),
            Some(_) => Err(Error::TypeMismatch(name.to_string())),
            None => Err(Error::MissingChannel(name.to_string())),
        }
    }
}
