//! Toy training regimen
//!
//! Trains an encoder on random input with a synthetic objective so that the
//! epoch notifier, the loss tracker and the segmenting REINFORCE term can be
//! watched together. Run with `cargo run --example toy_regimen [config.toml]`.

use std::cell::RefCell;
use std::rc::Rc;

use burn::backend::{Autodiff, NdArray};
use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer, SgdConfig};
use burn::tensor::{Distribution, ElementConversion, Tensor};

use nmt::model::{Encoder, Transducer};
use nmt::training::{EpochNotifier, LossScore, LossTracker, LossValues};
use nmt::vocab::ES;
use nmt::{Config, ExpressionSequence, RegimenId, Result};

type Backend = Autodiff<NdArray<f32>>;

fn input_dim(config: &Config) -> usize {
    config
        .encoder
        .declared_input_dim(&config.defaults)
        .unwrap_or(config.defaults.default_layer_dim)
}

fn random_batch<B: burn::tensor::backend::Backend>(
    batch: usize,
    seq_len: usize,
    dim: usize,
    device: &B::Device,
) -> ExpressionSequence<B> {
    ExpressionSequence::from_tensor(Tensor::random(
        [batch, seq_len, dim],
        Distribution::Normal(0.0, 1.0),
        device,
    ))
}

/// Mean squared activation per sentence [batch]
fn sentence_energy<B: burn::tensor::backend::Backend>(out: ExpressionSequence<B>) -> Tensor<B, 1> {
    let [batch, len, dim] = out.as_tensor().dims();
    out.into_tensor()
        .powf_scalar(2.0)
        .reshape([batch, len * dim])
        .mean_dim(1)
        .reshape([batch])
}

fn run(
    config: &Config,
    epochs: usize,
    sents: usize,
    batch_size: usize,
    seq_len: usize,
    lr: f64,
    model_path: &str,
) -> Result<()> {
    let device = Default::default();
    let regimen = RegimenId(0);
    let dim = input_dim(config);
    let batch_size = batch_size.max(1);

    let mut encoder = Encoder::<Backend>::new(&device, &config.encoder, &config.defaults)?;
    let mut optimizer = SgdConfig::new().init();

    let tracker = Rc::new(RefCell::new(LossTracker::<LossScore>::new(
        regimen,
        config.tracker.eval_every,
        config.tracker.name.clone(),
    )));
    let mut notifier = EpochNotifier::new();
    notifier.register(tracker.clone());

    if let Some(parent) = std::path::Path::new(model_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    log::info!(
        "Training {} encoder on {} random sentences per epoch",
        encoder.kind(),
        sents
    );

    for _ in 0..epochs {
        notifier.new_epoch(regimen, sents);
        encoder.new_epoch();

        let mut done = 0;
        while done < sents {
            let n = batch_size.min(sents - done);
            done += n;

            encoder.set_train(true);
            let out = encoder.transduce(random_batch(n, seq_len, dim, &device));
            let energy = sentence_energy(out);
            let mle = energy.clone().mean();

            let mut loss_values = LossValues::single("mle", mle.clone().into_scalar().elem::<f64>());
            let mut loss = mle;
            if let Some(reinforce) = encoder.calc_reinforce_loss(energy.neg()) {
                loss_values.add("reinforce", reinforce.clone().into_scalar().elem::<f64>());
                loss = loss + reinforce;
            }

            let grads = GradientsParams::from_grads(loss.backward(), &encoder);
            encoder = optimizer.step(lr, encoder, grads);

            let src = vec![(); n];
            let trg: Vec<Vec<u32>> = (0..n)
                .map(|_| {
                    let mut sent: Vec<u32> = (2..seq_len as u32 + 2).collect();
                    sent.push(ES);
                    sent
                })
                .collect();

            let mut tracker = tracker.borrow_mut();
            tracker.update_epoch_loss(&src, &trg, &loss_values);
            tracker.report_train_process();

            if tracker.should_report_dev() {
                tracker.new_dev();
                let dev_loss = evaluate(&encoder, seq_len, dim, batch_size);
                tracker.set_dev_score(batch_size * seq_len, LossScore(dev_loss));
                if tracker.report_dev_and_check_model(model_path)? {
                    encoder.save(model_path)?;
                }
            }
        }
    }

    Ok(())
}

/// Dev loss of the encoder in evaluation mode on a fresh random batch
fn evaluate(encoder: &Encoder<Backend>, seq_len: usize, dim: usize, batch_size: usize) -> f64 {
    let mut valid = encoder.valid();
    valid.set_train(false);
    let device = Default::default();
    let out = valid.transduce(random_batch(batch_size, seq_len, dim, &device));
    sentence_energy(out).mean().into_scalar().elem::<f64>()
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => match Config::load(&path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Error loading config: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    if let Err(e) = run(&config, 3, 2000, 50, 12, 0.01, "model/encoder") {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
