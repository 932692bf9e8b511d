// tests/gradient_tests.rs
//
// End-to-end gradient check: analytic gradients of the composite loss with
// respect to every trainable parameter agree with central finite differences,
// for each assignment regime and loss variant.


use ndarray::Array2;

use pwnet::config::{Preset, WrapperConfig};
use pwnet::dataset::Labels;
use pwnet::loss::composite_loss;
use pwnet::model::projection_net::Mode;
use pwnet::model::{Gradients, SurrogateModel};

use wrapper_testkit::{build_model, dataset_for, small_config};

const H: f64 = 1e-6;
const SAMPLES_PER_PARAM: usize = 6;

struct Problem {
    cfg: WrapperConfig,
    x: Array2<f64>,
    labels: Labels,
    classes: Vec<usize>,
}

impl Problem {
    fn new(preset: Preset, seed: u64) -> Self {
        let cfg = small_config(preset);
        let set = dataset_for(&cfg, 6, seed);
        let labels = set.labels().clone();
        let classes = labels.classes(cfg.model.label_derivation).unwrap();
        Self {
            x: set.embeddings().clone(),
            cfg,
            labels,
            classes,
        }
    }

    fn loss(&self, model: &mut SurrogateModel) -> f64 {
        let pass = model.forward(&self.x, Mode::Train, None).unwrap();
        composite_loss(model, &pass, &self.labels, &self.classes, &self.cfg.loss)
            .unwrap()
            .breakdown
            .total
    }

    fn gradients(&self, model: &mut SurrogateModel) -> Gradients {
        let pass = model.forward(&self.x, Mode::Train, None).unwrap();
        let out = composite_loss(model, &pass, &self.labels, &self.classes, &self.cfg.loss).unwrap();
        let mut grads = model
            .backward(&pass, &out.d_logits, &out.d_distances, &out.d_prototypes)
            .unwrap();
        grads.merge(out.param_grads);
        grads
    }
}

fn nudge(model: &mut SurrogateModel, name: &str, index: usize, delta: f64) {
    for (n, mut p) in model.trainable_params_mut() {
        if n == name {
            if let Some(v) = p.iter_mut().nth(index) {
                *v += delta;
            }
        }
    }
}

fn param_sizes(model: &mut SurrogateModel) -> Vec<(&'static str, usize)> {
    model
        .trainable_params_mut()
        .into_iter()
        .map(|(n, p)| (n, p.len()))
        .collect()
}

fn check(problem: &Problem, model: &mut SurrogateModel) {
    let grads = problem.gradients(model);
    for (name, len) in param_sizes(model) {
        let analytic = grads
            .get(name)
            .unwrap_or_else(|| panic!("no gradient for {name}"))
            .clone();
        let stride = (len / SAMPLES_PER_PARAM).max(1);
        for i in (0..len).step_by(stride) {
            nudge(model, name, i, H);
            let up = problem.loss(model);
            nudge(model, name, i, -2.0 * H);
            let down = problem.loss(model);
            nudge(model, name, i, H);

            let fd = (up - down) / (2.0 * H);
            let an = analytic.iter().nth(i).copied().unwrap();
            let tol = 1e-5 + 1e-4 * fd.abs().max(an.abs());
            assert!(
                (fd - an).abs() <= tol,
                "{name}[{i}]: finite difference {fd}, analytic {an}"
            );
        }
    }
}

#[test]
fn strict_blocks_with_batch_norm() {
    let problem = Problem::new(Preset::LunarLander, 1);
    let mut model = build_model(&problem.cfg, 2);
    check(&problem, &mut model);
}

#[test]
fn strict_signed_pairs_with_tanh_outputs() {
    let problem = Problem::new(Preset::BipedalWalker, 3);
    let mut model = build_model(&problem.cfg, 4);
    check(&problem, &mut model);
}

#[test]
fn soft_slots_in_raw_space_with_instance_norm() {
    let problem = Problem::new(Preset::CarRacing, 5);
    let mut model = build_model(&problem.cfg, 6);
    model.set_temperature(2.0);
    check(&problem, &mut model);
}

#[test]
fn soft_slots_below_temperature_floor() {
    let problem = Problem::new(Preset::CarRacing, 7);
    let mut model = build_model(&problem.cfg, 8);
    model.set_temperature(0.0);
    check(&problem, &mut model);
}
