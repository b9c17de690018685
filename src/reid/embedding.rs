use ndarray::Array1;

/// L2-normalized appearance vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding(Array1<f32>);

impl Embedding {
    /// Normalize `values` to unit length. An all-zero vector stays zero and
    /// never matches anything.
    pub fn new(values: Vec<f32>) -> Self {
        let mut v = Array1::from_vec(values);
        let norm = v.dot(&v).sqrt();
        if norm > f32::EPSILON {
            v.mapv_inplace(|x| x / norm);
        }
        Self(v)
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> Option<&[f32]> {
        self.0.as_slice()
    }

    /// Cosine similarity; `None` when dimensions differ.
    pub fn similarity(&self, other: &Embedding) -> Option<f32> {
        (self.dim() == other.dim()).then(|| self.0.dot(&other.0))
    }

    /// Normalized mean of several embeddings of equal dimension.
    pub fn mean<'a>(items: impl IntoIterator<Item = &'a Embedding>) -> Option<Embedding> {
        let mut iter = items.into_iter();
        let first = iter.next()?;
        let mut acc = first.0.clone();
        for e in iter {
            if e.dim() == acc.len() {
                acc += &e.0;
            }
        }
        Some(Embedding::new(acc.to_vec()))
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Embedding::new(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized() {
        let e = Embedding::new(vec![3.0, 4.0]);
        assert_eq!(e.as_slice(), Some(&[0.6, 0.8][..]));
        assert!((e.similarity(&e).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_dimension_mismatch() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert_eq!(a.similarity(&b), None);
    }

    #[test]
    fn test_mean() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        let m = Embedding::mean([&a, &b]).unwrap();
        let s = std::f32::consts::FRAC_1_SQRT_2;
        assert!((m.similarity(&a).unwrap() - s).abs() < 1e-5);
    }
}
