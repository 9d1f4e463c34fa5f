use crate::{error::CheckpointError, tensor::StateDict};

/// Shadow copy of the model parameters, smoothed after every optimizer step.
///
/// The shadow is never used to compute gradients; it is only read for evaluation
/// and checkpointing.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialMovingAverage {
    momentum: f64,
    shadow: StateDict,
}

impl ExponentialMovingAverage {
    pub fn new(weights: &StateDict, momentum: f64) -> Self {
        Self {
            momentum,
            shadow: weights.clone(),
        }
    }

    /// `shadow = shadow * (1 - momentum) + momentum * param` for every parameter.
    pub fn update(&mut self, weights: &StateDict) -> Result<(), CheckpointError> {
        let momentum = self.momentum as f32;
        for (name, shadow) in self.shadow.iter_mut() {
            let param = weights
                .get(name)
                .filter(|param| param.shape() == shadow.shape())
                .ok_or_else(|| CheckpointError::EmaMismatch(name.clone()))?;
            for (s, p) in shadow.data_mut().iter_mut().zip(param.data()) {
                *s = *s * (1.0 - momentum) + momentum * p;
            }
        }
        Ok(())
    }

    /// Replace the shadow, e.g. with weights restored from a checkpoint. The new
    /// weights must cover the same parameters with the same shapes.
    pub fn load_state(&mut self, weights: StateDict) -> Result<(), CheckpointError> {
        if let Some(name) = self
            .shadow
            .iter()
            .find(|(name, shadow)| {
                weights
                    .get(*name)
                    .map_or(true, |w| w.shape() != shadow.shape())
            })
            .map(|(name, _)| name.clone())
            .or_else(|| weights.keys().find(|k| !self.shadow.contains_key(*k)).cloned())
        {
            return Err(CheckpointError::EmaMismatch(name));
        }
        self.shadow = weights;
        Ok(())
    }

    pub fn state(&self) -> &StateDict {
        &self.shadow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Tensor;

    fn dict(value: f32) -> StateDict {
        StateDict::from([("w".to_string(), Tensor::full(vec![2], value))])
    }

    #[test]
    fn blends_towards_params() {
        let mut ema = ExponentialMovingAverage::new(&dict(0.0), 0.25);
        ema.update(&dict(1.0)).unwrap();
        assert_eq!(ema.state()["w"].data(), &[0.25, 0.25]);
        ema.update(&dict(1.0)).unwrap();
        assert_eq!(ema.state()["w"].data(), &[0.4375, 0.4375]);
    }

    #[test]
    fn starts_as_a_copy() {
        let ema = ExponentialMovingAverage::new(&dict(3.0), 0.0001);
        assert_eq!(ema.state(), &dict(3.0));
    }

    #[test]
    fn refuses_mismatched_parameters() {
        let mut ema = ExponentialMovingAverage::new(&dict(0.0), 0.5);
        let other = StateDict::from([("v".to_string(), Tensor::full(vec![2], 1.0))]);
        assert!(matches!(
            ema.update(&other),
            Err(CheckpointError::EmaMismatch(name)) if name == "w"
        ));

        let reshaped = StateDict::from([("w".to_string(), Tensor::full(vec![3], 1.0))]);
        assert!(ema.load_state(reshaped).is_err());
        ema.load_state(dict(9.0)).unwrap();
        assert_eq!(ema.state(), &dict(9.0));
    }
}
