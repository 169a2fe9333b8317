//! Training progress tracking and best-model selection
//!
//! One tracker belongs to one training regimen. It accumulates per-batch loss
//! and word counts, emits a train report every `EVAL_TRAIN_EVERY` sentences
//! (and at epoch end), and decides after each dev evaluation whether the model
//! should be saved.

use std::fmt;
use std::time::{Duration, Instant};

use crate::training::events::EpochListener;
use crate::training::loss::LossValues;
use crate::training::score::EvalScore;
use crate::vocab;
use crate::{NmtError, RegimenId, Result};

/// Sentences between two train reports
pub const EVAL_TRAIN_EVERY: usize = 1000;

/// Format elapsed wall-clock time as `D-HH:MM:SS`
pub fn format_time(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!(
        "{}-{:02}:{:02}:{:02}",
        secs / 86400,
        (secs % 86400) / 3600,
        (secs % 3600) / 60,
        secs % 60
    )
}

/// Throughput, undefined when no time has passed
pub fn words_per_sec(words: usize, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        Some(words as f64 / secs)
    } else {
        None
    }
}

fn format_rate(rate: Option<f64>) -> String {
    match rate {
        Some(rate) => format!("{:.2}", rate),
        None => "n/a".to_string(),
    }
}

/// One train progress report
#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    pub fractional_epoch: f64,
    /// Summed loss over all components divided by target words this epoch
    pub loss_per_word: f64,
    pub words: usize,
    pub words_per_sec: Option<f64>,
    pub elapsed: Duration,
    /// Per-word value of each component; empty when there is only one
    pub components: Vec<(String, f64)>,
}

impl TrainReport {
    /// Extra lines listing each loss component
    pub fn component_lines(&self) -> Vec<String> {
        self.components
            .iter()
            .map(|(name, value)| format!("- {} {:5.6}", name, value))
            .collect()
    }
}

impl fmt::Display for TrainReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Epoch {:.4}: train_loss/word={:.6} (words={}, words/sec={}, time={})",
            self.fractional_epoch,
            self.loss_per_word,
            self.words,
            format_rate(self.words_per_sec),
            format_time(self.elapsed)
        )
    }
}

/// One dev evaluation report
#[derive(Debug, Clone, PartialEq)]
pub struct DevReport {
    pub fractional_epoch: f64,
    pub score: String,
    pub words: usize,
    pub words_per_sec: Option<f64>,
    pub elapsed: Duration,
}

impl fmt::Display for DevReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  Epoch {:.4} dev {} (words={}, words/sec={}, time={})",
            self.fractional_epoch,
            self.score,
            self.words,
            format_rate(self.words_per_sec),
            format_time(self.elapsed)
        )
    }
}

/// Loss and progress tracker for one training regimen
///
/// Idle until the first matching `on_new_epoch`; idle trackers never report.
#[derive(Debug)]
pub struct LossTracker<S: EvalScore> {
    regimen: RegimenId,
    name: Option<String>,
    eval_train_every: usize,
    eval_dev_every: usize,

    epoch_num: usize,
    total_train_sent: usize,
    epoch_loss: LossValues,
    epoch_words: usize,
    sent_num: usize,
    sent_num_not_report_train: usize,
    sent_num_not_report_dev: usize,
    fractional_epoch: f64,

    dev_score: Option<S>,
    best_dev_score: Option<S>,
    dev_words: usize,

    last_report_words: usize,
    start_time: Instant,
    last_report_train_time: Instant,
    dev_start_time: Instant,
}

impl<S: EvalScore> LossTracker<S> {
    /// Create a tracker for `regimen`
    ///
    /// # Arguments
    /// * `regimen` - The only regimen whose epoch events this tracker accepts
    /// * `eval_dev_every` - Sentences between dev evaluations; 0 means once per epoch
    /// * `name` - Optional prefix for every report line
    pub fn new(regimen: RegimenId, eval_dev_every: usize, name: Option<String>) -> Self {
        let now = Instant::now();
        LossTracker {
            regimen,
            name,
            eval_train_every: EVAL_TRAIN_EVERY,
            eval_dev_every,
            epoch_num: 0,
            total_train_sent: 0,
            epoch_loss: LossValues::new(),
            epoch_words: 0,
            sent_num: 0,
            sent_num_not_report_train: 0,
            sent_num_not_report_dev: 0,
            fractional_epoch: 0.0,
            dev_score: None,
            best_dev_score: None,
            dev_words: 0,
            last_report_words: 0,
            start_time: now,
            last_report_train_time: now,
            dev_start_time: now,
        }
    }

    /// Account for one training batch
    ///
    /// # Arguments
    /// * `src` - Source sentences of the batch (only counted)
    /// * `trg` - Target token ids; `vocab::ES` entries are padding and not counted
    /// * `loss` - Loss components of the batch
    pub fn update_epoch_loss<Src, Trg: AsRef<[u32]>>(
        &mut self,
        src: &[Src],
        trg: &[Trg],
        loss: &LossValues,
    ) {
        let batch_sents = src.len();
        self.sent_num += batch_sents;
        self.sent_num_not_report_train += batch_sents;
        self.sent_num_not_report_dev += batch_sents;
        self.epoch_words += trg
            .iter()
            .map(|sent| vocab::count_words(sent.as_ref()))
            .sum::<usize>();
        self.epoch_loss += loss;
    }

    fn epoch_complete(&self) -> bool {
        self.sent_num == self.total_train_sent
    }

    fn compute_fractional_epoch(&self) -> f64 {
        let base = self.epoch_num.saturating_sub(1) as f64;
        if self.total_train_sent == 0 {
            base
        } else {
            base + self.sent_num as f64 / self.total_train_sent as f64
        }
    }

    fn per_word(&self, value: f64) -> f64 {
        if self.epoch_words == 0 {
            f64::NAN
        } else {
            value / self.epoch_words as f64
        }
    }

    /// Prefix `line` with the tracker name, if any
    pub fn format_line(&self, line: &str) -> String {
        match &self.name {
            Some(name) => format!("[{}] {}", name, line),
            None => line.to_string(),
        }
    }

    fn print_log(&self, line: &str) {
        log::info!("{}", self.format_line(line));
    }

    /// Emit a train report if one is due
    ///
    /// Due when `EVAL_TRAIN_EVERY` sentences have passed since the last report
    /// or the epoch is complete. An empty epoch never reports. Returns the
    /// report when it fired.
    pub fn report_train_process(&mut self) -> Option<TrainReport> {
        if self.epoch_num == 0 || self.total_train_sent == 0 {
            return None;
        }
        let due = self.sent_num_not_report_train >= self.eval_train_every || self.epoch_complete();
        if !due {
            return None;
        }

        self.sent_num_not_report_train %= self.eval_train_every;
        self.fractional_epoch = self.compute_fractional_epoch();

        let now = Instant::now();
        let components = if self.epoch_loss.len() > 1 {
            self.epoch_loss
                .iter()
                .map(|(name, value)| (name.to_string(), self.per_word(value)))
                .collect()
        } else {
            Vec::new()
        };

        let report = TrainReport {
            fractional_epoch: self.fractional_epoch,
            loss_per_word: self.per_word(self.epoch_loss.sum()),
            words: self.epoch_words,
            words_per_sec: words_per_sec(
                self.epoch_words - self.last_report_words,
                now.duration_since(self.last_report_train_time),
            ),
            elapsed: now.duration_since(self.start_time),
            components,
        };

        self.print_log(&report.to_string());
        for line in report.component_lines() {
            self.print_log(&line);
        }

        self.last_report_words = self.epoch_words;
        self.last_report_train_time = now;

        Some(report)
    }

    /// Start timing a dev evaluation
    pub fn new_dev(&mut self) {
        self.dev_start_time = Instant::now();
    }

    /// Record the result of a dev evaluation over `dev_words` words
    pub fn set_dev_score(&mut self, dev_words: usize, dev_score: S) {
        self.dev_score = Some(dev_score);
        self.dev_words = dev_words;
    }

    /// Whether a dev evaluation is due
    pub fn should_report_dev(&self) -> bool {
        if self.epoch_num == 0 || self.total_train_sent == 0 {
            return false;
        }
        if self.eval_dev_every > 0 {
            self.sent_num_not_report_dev >= self.eval_dev_every || self.epoch_complete()
        } else {
            self.sent_num_not_report_dev >= self.total_train_sent
        }
    }

    /// Report the current dev score and decide whether to save the model
    ///
    /// Returns `true` when the score is strictly better than the best so far;
    /// the caller is responsible for writing the model to `model_path`.
    pub fn report_dev_and_check_model(&mut self, model_path: &str) -> Result<bool> {
        let score = self.dev_score.clone().ok_or(NmtError::MissingDevScore)?;
        let now = Instant::now();

        let period = if self.eval_dev_every != 0 {
            self.eval_dev_every
        } else {
            self.total_train_sent
        };
        if period > 0 {
            self.sent_num_not_report_dev %= period;
        }
        self.fractional_epoch = self.compute_fractional_epoch();

        let report = DevReport {
            fractional_epoch: self.fractional_epoch,
            score: score.to_string(),
            words: self.dev_words,
            words_per_sec: words_per_sec(self.dev_words, now.duration_since(self.dev_start_time)),
            elapsed: now.duration_since(self.start_time),
        };
        self.print_log(&report.to_string());

        let save_model = score.better_than(self.best_dev_score.as_ref());
        if save_model {
            self.best_dev_score = Some(score);
            self.print_log(&format!(
                "  Epoch {:.4}: best dev score, writing model to {}",
                self.fractional_epoch, model_path
            ));
        }

        Ok(save_model)
    }

    /// Log an additional dev metric without touching any counter
    pub fn report_auxiliary_score(&self, score: &impl fmt::Display) {
        self.print_log(&format!(
            "  Epoch {:.4} dev [auxiliary] {}",
            self.fractional_epoch, score
        ));
    }

    /// Reset the sentence counters
    pub fn clear_counters(&mut self) {
        self.sent_num = 0;
        self.sent_num_not_report_dev = 0;
        self.sent_num_not_report_train = 0;
    }

    pub fn regimen(&self) -> RegimenId {
        self.regimen
    }

    pub fn epoch_num(&self) -> usize {
        self.epoch_num
    }

    pub fn total_train_sent(&self) -> usize {
        self.total_train_sent
    }

    pub fn sent_num(&self) -> usize {
        self.sent_num
    }

    pub fn epoch_words(&self) -> usize {
        self.epoch_words
    }

    pub fn epoch_loss(&self) -> &LossValues {
        &self.epoch_loss
    }

    pub fn sent_num_not_report_train(&self) -> usize {
        self.sent_num_not_report_train
    }

    pub fn sent_num_not_report_dev(&self) -> usize {
        self.sent_num_not_report_dev
    }

    pub fn fractional_epoch(&self) -> f64 {
        self.fractional_epoch
    }

    pub fn best_dev_score(&self) -> Option<&S> {
        self.best_dev_score.as_ref()
    }
}

impl<S: EvalScore> EpochListener for LossTracker<S> {
    /// Clear epoch-wise counters when this tracker's regimen starts an epoch
    fn on_new_epoch(&mut self, regimen: RegimenId, num_sents: usize) {
        if regimen != self.regimen {
            return;
        }
        self.total_train_sent = num_sents;
        self.epoch_loss = LossValues::new();
        self.epoch_words = 0;
        self.epoch_num += 1;
        self.sent_num = 0;
        self.sent_num_not_report_train = 0;
        self.sent_num_not_report_dev = 0;
        self.last_report_words = 0;
        self.last_report_train_time = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::events::EpochNotifier;
    use crate::training::score::{BleuScore, LossScore};
    use crate::vocab::ES;
    use std::cell::RefCell;
    use std::rc::Rc;

    const REGIMEN: RegimenId = RegimenId(1);

    fn tracker(eval_dev_every: usize) -> LossTracker<LossScore> {
        LossTracker::new(REGIMEN, eval_dev_every, None)
    }

    /// A batch of `n` sentences, each with `words` real tokens plus padding
    fn batch(n: usize, words: usize) -> (Vec<u32>, Vec<Vec<u32>>) {
        let src = vec![0u32; n];
        let trg = (0..n)
            .map(|_| {
                let mut sent: Vec<u32> = (0..words).map(|w| w as u32 + 10).collect();
                sent.extend([ES, ES]);
                sent
            })
            .collect();
        (src, trg)
    }

    #[test]
    fn test_idle_tracker_never_reports() {
        let mut t = tracker(0);
        assert!(t.report_train_process().is_none());
        assert!(!t.should_report_dev());
    }

    #[test]
    fn test_new_epoch_for_other_regimen_is_ignored() {
        let mut t = tracker(0);
        t.on_new_epoch(RegimenId(2), 50);
        assert_eq!(t.epoch_num(), 0);

        t.on_new_epoch(REGIMEN, 50);
        assert_eq!(t.epoch_num(), 1);
        assert_eq!(t.total_train_sent(), 50);
    }

    #[test]
    fn test_new_epoch_resets_counters() {
        let mut t = tracker(0);
        t.on_new_epoch(REGIMEN, 10);
        let (src, trg) = batch(4, 3);
        t.update_epoch_loss(&src, &trg, &LossValues::single("mle", 2.0));
        assert_eq!(t.sent_num(), 4);
        assert_eq!(t.epoch_words(), 12);

        t.on_new_epoch(REGIMEN, 10);
        assert_eq!(t.epoch_num(), 2);
        assert_eq!(t.sent_num(), 0);
        assert_eq!(t.epoch_words(), 0);
        assert!(t.epoch_loss().is_empty());
        assert_eq!(t.sent_num_not_report_train(), 0);
        assert_eq!(t.sent_num_not_report_dev(), 0);
    }

    #[test]
    fn test_loss_per_word_at_report() {
        let mut t = tracker(0);
        t.on_new_epoch(REGIMEN, 6);

        let mut total_loss = 0.0;
        let mut total_words = 0;
        for (n, words, loss) in [(2, 3, 1.5), (3, 5, 4.25), (1, 1, 0.75)] {
            let (src, trg) = batch(n, words);
            t.update_epoch_loss(&src, &trg, &LossValues::single("mle", loss));
            total_loss += loss;
            total_words += n * words;
        }

        let report = t.report_train_process().unwrap();
        assert_eq!(report.words, total_words);
        assert!((report.loss_per_word - total_loss / total_words as f64).abs() < 1e-9);
        assert!((report.fractional_epoch - 1.0).abs() < 1e-12);
        assert!(report.components.is_empty());
    }

    #[test]
    fn test_component_lines_when_several_losses() {
        let mut t = tracker(0);
        t.on_new_epoch(REGIMEN, 2);
        let (src, trg) = batch(2, 4);
        t.update_epoch_loss(
            &src,
            &trg,
            &LossValues::single("mle", 4.0).with("reinforce", 2.0),
        );

        let report = t.report_train_process().unwrap();
        assert_eq!(
            report.components,
            vec![("mle".to_string(), 0.5), ("reinforce".to_string(), 0.25)]
        );
        assert_eq!(report.component_lines()[0], "- mle 0.500000");
    }

    #[test]
    fn test_train_report_cadence() {
        let mut t = tracker(0);
        t.on_new_epoch(REGIMEN, 2500);

        let mut fired_at = Vec::new();
        for step in 1..=10 {
            let (src, trg) = batch(250, 2);
            t.update_epoch_loss(&src, &trg, &LossValues::single("mle", 1.0));
            if t.report_train_process().is_some() {
                fired_at.push(step * 250);
                assert!(t.sent_num_not_report_train() < EVAL_TRAIN_EVERY);
            }
        }

        // Every 1000 sentences, plus the end of the epoch
        assert_eq!(fired_at, vec![1000, 2000, 2500]);
        assert_eq!(t.sent_num_not_report_train(), 500);
    }

    #[test]
    fn test_train_counter_keeps_remainder() {
        let mut t = tracker(0);
        t.on_new_epoch(REGIMEN, 5000);
        let (src, trg) = batch(1300, 1);
        t.update_epoch_loss(&src, &trg, &LossValues::single("mle", 1.0));

        assert!(t.report_train_process().is_some());
        assert_eq!(t.sent_num_not_report_train(), 300);
        assert!(t.report_train_process().is_none());
    }

    #[test]
    fn test_dev_once_per_epoch() {
        let mut t = tracker(0);
        t.on_new_epoch(REGIMEN, 100);

        let mut due_at = Vec::new();
        for sent in 1..=100 {
            let (src, trg) = batch(1, 3);
            t.update_epoch_loss(&src, &trg, &LossValues::single("mle", 1.0));
            if t.should_report_dev() {
                due_at.push(sent);
                t.set_dev_score(10, LossScore(1.0));
                t.report_dev_and_check_model("model.mpk").unwrap();
            }
        }

        assert_eq!(due_at, vec![100]);
        assert!(!t.should_report_dev());
    }

    #[test]
    fn test_dev_periodic() {
        let mut t = tracker(30);
        t.on_new_epoch(REGIMEN, 100);

        let mut due_at = Vec::new();
        for step in 1..=10 {
            let (src, trg) = batch(10, 1);
            t.update_epoch_loss(&src, &trg, &LossValues::single("mle", 1.0));
            if t.should_report_dev() {
                due_at.push(step * 10);
                t.set_dev_score(10, LossScore(1.0));
                t.report_dev_and_check_model("model.mpk").unwrap();
            }
        }

        assert_eq!(due_at, vec![30, 60, 90, 100]);
    }

    #[test]
    fn test_best_dev_score_selection() {
        let mut t = tracker(0);
        t.on_new_epoch(REGIMEN, 10);

        let mut decisions = Vec::new();
        for loss in [5.0, 6.0, 4.0, 4.0, 3.5] {
            t.set_dev_score(100, LossScore(loss));
            decisions.push(t.report_dev_and_check_model("model.mpk").unwrap());
        }

        assert_eq!(decisions, vec![true, false, true, false, true]);
        assert_eq!(t.best_dev_score(), Some(&LossScore(3.5)));
    }

    #[test]
    fn test_best_dev_score_higher_is_better() {
        let mut t = LossTracker::<BleuScore>::new(REGIMEN, 0, Some("mt".to_string()));
        t.on_new_epoch(REGIMEN, 10);

        t.set_dev_score(100, BleuScore(20.0));
        assert!(t.report_dev_and_check_model("model.mpk").unwrap());
        t.set_dev_score(100, BleuScore(18.0));
        assert!(!t.report_dev_and_check_model("model.mpk").unwrap());
        assert_eq!(t.best_dev_score(), Some(&BleuScore(20.0)));
    }

    #[test]
    fn test_report_dev_without_score_fails() {
        let mut t = tracker(0);
        t.on_new_epoch(REGIMEN, 10);
        assert!(matches!(
            t.report_dev_and_check_model("model.mpk"),
            Err(NmtError::MissingDevScore)
        ));
    }

    #[test]
    fn test_auxiliary_score_has_no_counter_effects() {
        let mut t = tracker(0);
        t.on_new_epoch(REGIMEN, 10);
        let (src, trg) = batch(3, 2);
        t.update_epoch_loss(&src, &trg, &LossValues::single("mle", 1.0));

        t.report_auxiliary_score(&BleuScore(12.0));
        assert_eq!(t.sent_num(), 3);
        assert_eq!(t.sent_num_not_report_dev(), 3);
        assert_eq!(t.epoch_words(), 6);
    }

    #[test]
    fn test_clear_counters() {
        let mut t = tracker(0);
        t.on_new_epoch(REGIMEN, 10);
        let (src, trg) = batch(3, 2);
        t.update_epoch_loss(&src, &trg, &LossValues::single("mle", 1.0));

        t.clear_counters();
        assert_eq!(t.sent_num(), 0);
        assert_eq!(t.sent_num_not_report_train(), 0);
        assert_eq!(t.sent_num_not_report_dev(), 0);
        assert_eq!(t.epoch_words(), 6);
    }

    #[test]
    fn test_format_line_prefix() {
        let named = LossTracker::<LossScore>::new(REGIMEN, 0, Some("en-de".to_string()));
        assert_eq!(named.format_line("hello"), "[en-de] hello");
        assert_eq!(tracker(0).format_line("hello"), "hello");
    }

    #[test]
    fn test_format_time_and_rate() {
        assert_eq!(format_time(Duration::from_secs(0)), "0-00:00:00");
        assert_eq!(format_time(Duration::from_secs(90061)), "1-01:01:01");
        assert_eq!(words_per_sec(100, Duration::ZERO), None);
        assert_eq!(words_per_sec(100, Duration::from_secs(4)), Some(25.0));
    }

    #[test]
    fn test_train_report_display() {
        let report = TrainReport {
            fractional_epoch: 1.5,
            loss_per_word: 2.0,
            words: 300,
            words_per_sec: None,
            elapsed: Duration::from_secs(61),
            components: Vec::new(),
        };
        assert_eq!(
            report.to_string(),
            "Epoch 1.5000: train_loss/word=2.000000 (words=300, words/sec=n/a, time=0-00:01:01)"
        );
    }

    #[test]
    fn test_trackers_follow_notifier() {
        let first = Rc::new(RefCell::new(tracker(0)));
        let second = Rc::new(RefCell::new(LossTracker::<LossScore>::new(
            RegimenId(2),
            0,
            None,
        )));

        let mut notifier = EpochNotifier::new();
        notifier.register(first.clone());
        notifier.register(second.clone());

        notifier.new_epoch(REGIMEN, 40);
        assert_eq!(first.borrow().epoch_num(), 1);
        assert_eq!(first.borrow().total_train_sent(), 40);
        assert_eq!(second.borrow().epoch_num(), 0);
    }

    #[test]
    fn test_empty_epoch_never_reports() {
        let mut t = tracker(0);
        t.on_new_epoch(REGIMEN, 0);

        for _ in 0..5 {
            assert!(!t.should_report_dev());
            assert!(t.report_train_process().is_none());
        }

        let mut periodic = tracker(10);
        periodic.on_new_epoch(REGIMEN, 0);
        assert!(!periodic.should_report_dev());
    }
}
