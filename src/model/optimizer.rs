use ndarray::Array4;
use std::collections::HashMap;

use super::config::OptimizerType;

/// Trait pour les optimiseurs
pub trait Optimizer: Send + Sync {
    fn step(&mut self, param_id: &str, param: &mut Array4<f32>, grad: &Array4<f32>);
    fn get_lr(&self) -> f32;
    fn name(&self) -> &'static str;
}

/// Construit l'optimiseur décrit par la configuration d'entraînement
pub fn build_optimizer(optimizer_type: &OptimizerType, learning_rate: f32) -> Box<dyn Optimizer> {
    match *optimizer_type {
        OptimizerType::Adam {
            beta1,
            beta2,
            epsilon,
        } => Box::new(Adam::new(learning_rate, beta1, beta2, epsilon)),
        OptimizerType::SGD { momentum } => Box::new(SGD::new(learning_rate, momentum)),
    }
}

/// Optimiseur SGD avec momentum
pub struct SGD {
    learning_rate: f32,
    momentum: f32,
    velocity: HashMap<String, Array4<f32>>,
}

impl SGD {
    pub fn new(learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            velocity: HashMap::new(),
        }
    }
}

impl Optimizer for SGD {
    fn step(&mut self, param_id: &str, param: &mut Array4<f32>, grad: &Array4<f32>) {
        let velocity = self
            .velocity
            .entry(param_id.to_string())
            .or_insert_with(|| Array4::zeros(param.dim()));

        // v = momentum * v - lr * grad
        velocity.map_inplace(|v| *v *= self.momentum);
        velocity.scaled_add(-self.learning_rate, grad);

        // param += v
        *param += &*velocity;
    }

    fn get_lr(&self) -> f32 {
        self.learning_rate
    }

    fn name(&self) -> &'static str {
        "sgd"
    }
}

struct AdamState {
    m: Array4<f32>,
    v: Array4<f32>,
    timestep: i32,
}

/// Optimiseur Adam, un compteur d'étapes par paramètre
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    state: HashMap<String, AdamState>,
}

impl Adam {
    pub fn new(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            state: HashMap::new(),
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, param_id: &str, param: &mut Array4<f32>, grad: &Array4<f32>) {
        let state = self
            .state
            .entry(param_id.to_string())
            .or_insert_with(|| AdamState {
                m: Array4::zeros(param.dim()),
                v: Array4::zeros(param.dim()),
                timestep: 0,
            });
        state.timestep += 1;

        let (beta1, beta2) = (self.beta1, self.beta2);

        // m_t = beta1 * m_{t-1} + (1 - beta1) * grad
        state.m.zip_mut_with(grad, |m, &g| *m = beta1 * *m + (1.0 - beta1) * g);

        // v_t = beta2 * v_{t-1} + (1 - beta2) * grad^2
        state.v.zip_mut_with(grad, |v, &g| *v = beta2 * *v + (1.0 - beta2) * g * g);

        // Correction du biais
        let m_correction = 1.0 - beta1.powi(state.timestep);
        let v_correction = 1.0 - beta2.powi(state.timestep);
        let (lr, epsilon) = (self.learning_rate, self.epsilon);

        // param -= lr * m_hat / (sqrt(v_hat) + epsilon)
        ndarray::Zip::from(param)
            .and(&state.m)
            .and(&state.v)
            .for_each(|p, &m, &v| {
                let m_hat = m / m_correction;
                let v_hat = v / v_correction;
                *p -= lr * m_hat / (v_hat.sqrt() + epsilon);
            });
    }

    fn get_lr(&self) -> f32 {
        self.learning_rate
    }

    fn name(&self) -> &'static str {
        "adam"
    }
}
