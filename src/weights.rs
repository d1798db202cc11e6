use std::{
    io,
    ops::{Deref, DerefMut},
};

use comms::{Codec, F32Codec};

/// A flat buffer of model weights, the payload every strategy combines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Weights(Vec<f32>);

impl Weights {
    /// Creates a new `Weights` filled with `value`.
    ///
    /// # Arguments
    /// * `value` - The value of every weight.
    /// * `len` - The amount of weights.
    pub fn filled(value: f32, len: usize) -> Self {
        Self(vec![value; len])
    }

    /// Consumes this buffer returning the inner vector.
    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }

    /// Adds `other` element-wise into `self`.
    ///
    /// # Panics
    /// If the lengths of both buffers differ.
    pub fn add_assign(&mut self, other: &Weights) {
        assert_eq!(self.len(), other.len(), "weights length mismatch");
        self.0.iter_mut().zip(&other.0).for_each(|(w, o)| *w += o);
    }

    /// Subtracts `other` element-wise from `self`.
    ///
    /// # Panics
    /// If the lengths of both buffers differ.
    pub fn sub_assign(&mut self, other: &Weights) {
        assert_eq!(self.len(), other.len(), "weights length mismatch");
        self.0.iter_mut().zip(&other.0).for_each(|(w, o)| *w -= o);
    }

    /// Multiplies every weight by `factor`.
    pub fn scale(&mut self, factor: f32) {
        self.0.iter_mut().for_each(|w| *w *= factor);
    }

    /// Adds every buffer in `all` together, in iteration order.
    ///
    /// # Returns
    /// The element-wise sum or `None` if `all` is empty.
    ///
    /// # Panics
    /// If the buffers have different lengths.
    pub fn sum<'a, I>(all: I) -> Option<Weights>
    where
        I: IntoIterator<Item = &'a Weights>,
    {
        let mut all = all.into_iter();
        let mut acc = all.next()?.clone();
        all.for_each(|w| acc.add_assign(w));
        Some(acc)
    }

    /// Averages every buffer in `all`, in iteration order.
    ///
    /// # Returns
    /// The element-wise mean or `None` if `all` is empty.
    ///
    /// # Panics
    /// If the buffers have different lengths.
    pub fn mean<'a, I>(all: I) -> Option<Weights>
    where
        I: IntoIterator<Item = &'a Weights>,
    {
        let mut count = 0;
        let summed = Self::sum(all.into_iter().inspect(|_| count += 1))?;
        let mut mean = summed;
        mean.scale(1.0 / count as f32);
        Some(mean)
    }
}

impl From<Vec<f32>> for Weights {
    fn from(value: Vec<f32>) -> Self {
        Self(value)
    }
}

impl Codec<Weights> for F32Codec {
    fn encode(&self, payload: &Weights) -> Vec<u8> {
        Codec::<Vec<f32>>::encode(self, &payload.0)
    }

    fn decode(&self, bytes: &[u8]) -> io::Result<Weights> {
        Codec::<Vec<f32>>::decode(self, bytes).map(Weights)
    }
}

impl Deref for Weights {
    type Target = [f32];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Weights {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
