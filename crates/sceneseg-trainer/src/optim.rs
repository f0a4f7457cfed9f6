//! Adam with named, persistable moment estimates.
//!
//! Same update as `candle_nn::AdamW`, but each parameter's first and second
//! moments are keyed by the parameter's name in the [`VarMap`], so they can
//! be written into a checkpoint and restored on resume.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::{Optimizer, ParamsAdamW, VarMap};
use tracing::warn;

const FIRST_MOMENT: &str = "adam.m.";
const SECOND_MOMENT: &str = "adam.v.";

struct Slot {
    name: String,
    var: Var,
    m: Var,
    v: Var,
}

pub struct Adam {
    slots: Vec<Slot>,
    params: ParamsAdamW,
    step_t: u64,
}

impl Adam {
    /// Tracks every float variable in `varmap`, ordered by name.
    pub fn from_varmap(varmap: &VarMap, params: ParamsAdamW) -> candle_core::Result<Self> {
        let mut named: Vec<(String, Var)> = {
            let data = varmap
                .data()
                .lock()
                .map_err(|_| candle_core::Error::Msg("parameter store lock poisoned".into()))?;
            data.iter()
                .map(|(name, var)| (name.clone(), var.clone()))
                .collect()
        };
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Self::with_names(named, params)
    }

    fn with_names(named: Vec<(String, Var)>, params: ParamsAdamW) -> candle_core::Result<Self> {
        let slots = named
            .into_iter()
            .filter(|(_, var)| var.dtype().is_float())
            .map(|(name, var)| {
                let m = Var::zeros(var.shape(), var.dtype(), var.device())?;
                let v = Var::zeros(var.shape(), var.dtype(), var.device())?;
                Ok(Slot { name, var, m, v })
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            slots,
            params,
            step_t: 0,
        })
    }

    /// Updates applied so far.
    pub fn step_count(&self) -> u64 {
        self.step_t
    }

    /// Moment tensors keyed for a checkpoint file.
    pub fn state_tensors(&self) -> Vec<(String, Tensor)> {
        self.slots
            .iter()
            .flat_map(|slot| {
                [
                    (format!("{FIRST_MOMENT}{}", slot.name), slot.m.as_tensor().clone()),
                    (format!("{SECOND_MOMENT}{}", slot.name), slot.v.as_tensor().clone()),
                ]
            })
            .collect()
    }

    /// Copies saved moments back in and resumes the update counter at
    /// `step_t`. Parameters with no saved moments start from zero.
    pub fn load_state(
        &mut self,
        tensors: &HashMap<String, Tensor>,
        step_t: u64,
    ) -> candle_core::Result<()> {
        let mut missing = 0usize;
        for slot in &self.slots {
            for (prefix, moment) in [(FIRST_MOMENT, &slot.m), (SECOND_MOMENT, &slot.v)] {
                match tensors.get(&format!("{prefix}{}", slot.name)) {
                    Some(saved) => {
                        let saved = saved.to_device(moment.device())?.to_dtype(moment.dtype())?;
                        moment.set(&saved)?;
                    }
                    None => missing += 1,
                }
            }
        }
        if missing > 0 {
            warn!(missing, "checkpoint lacks optimizer moments, starting them at zero");
        }
        self.step_t = step_t;
        Ok(())
    }
}

impl Optimizer for Adam {
    type Config = ParamsAdamW;

    fn new(vars: Vec<Var>, params: ParamsAdamW) -> candle_core::Result<Self> {
        let named = vars
            .into_iter()
            .enumerate()
            .map(|(i, var)| (format!("param{i}"), var))
            .collect();
        Self::with_names(named, params)
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.step_t += 1;
        let ParamsAdamW {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.params;
        let scale_m = 1.0 / (1.0 - beta1.powi(self.step_t as i32));
        let scale_v = 1.0 / (1.0 - beta2.powi(self.step_t as i32));
        for slot in &self.slots {
            let Some(g) = grads.get(&slot.var) else {
                continue;
            };
            let next_m = ((slot.m.as_tensor() * beta1)? + (g * (1.0 - beta1))?)?;
            let next_v = ((slot.v.as_tensor() * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;
            let m_hat = (&next_m * scale_m)?;
            let v_hat = (&next_v * scale_v)?;
            let decayed = (slot.var.as_tensor() * (1.0 - lr * weight_decay))?;
            let adjusted = (m_hat / (v_hat.sqrt()? + eps)?)?;
            let next_theta = (decayed - (adjusted * lr)?)?;
            slot.m.set(&next_m)?;
            slot.v.set(&next_v)?;
            slot.var.set(&next_theta)?;
        }
        Ok(())
    }
}
