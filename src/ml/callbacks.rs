//! 学習ループ用のコールバック
//!
//! どちらも検証損失（val_loss）を監視します。

/// 早期終了
///
/// val_lossが`patience`エポック連続で改善しなければ停止を指示する。
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best: f64,
    wait: usize,
}

/// `EarlyStopping::update`の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoppingDecision {
    /// 最良値を更新した（このエポックの重みを保存すべき）
    Improved,
    /// 改善なしだが継続
    Continue,
    /// 学習を打ち切る
    Stop,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best: f64::INFINITY,
            wait: 0,
        }
    }

    pub fn update(&mut self, val_loss: f64) -> StoppingDecision {
        if val_loss < self.best {
            self.best = val_loss;
            self.wait = 0;
            return StoppingDecision::Improved;
        }

        self.wait += 1;
        if self.wait >= self.patience {
            StoppingDecision::Stop
        } else {
            StoppingDecision::Continue
        }
    }

    pub fn best(&self) -> f64 {
        self.best
    }
}

/// 早期終了と最良モデルの保持
///
/// 最初のエポックと、val_lossを更新したエポックのスナップショットだけを残す。
#[derive(Debug, Clone)]
pub struct BestCheckpoint<M> {
    stopping: EarlyStopping,
    best: Option<(usize, M)>,
}

impl<M> BestCheckpoint<M> {
    pub fn new(patience: usize) -> Self {
        Self {
            stopping: EarlyStopping::new(patience),
            best: None,
        }
    }

    /// エポック終了時に呼ぶ（`epoch`は1始まり）
    pub fn observe(&mut self, epoch: usize, val_loss: f64, snapshot: M) -> StoppingDecision {
        let decision = self.stopping.update(val_loss);
        if decision == StoppingDecision::Improved || self.best.is_none() {
            self.best = Some((epoch, snapshot));
        }
        decision
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best.as_ref().map(|(epoch, _)| *epoch)
    }

    pub fn into_best(self) -> Option<(usize, M)> {
        self.best
    }
}

/// 停滞時に学習率を下げる
///
/// `patience`エポックの間、val_lossが`min_delta`を超えて改善しなければ
/// 学習率に`factor`を掛ける（`min_lr`未満にはしない）。
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    factor: f64,
    patience: usize,
    min_lr: f64,
    min_delta: f64,
    best: f64,
    wait: usize,
    lr: f64,
}

impl ReduceLrOnPlateau {
    pub const DEFAULT_MIN_DELTA: f64 = 1e-4;

    pub fn new(initial_lr: f64, factor: f64, patience: usize, min_lr: f64) -> Self {
        Self {
            factor,
            patience,
            min_lr,
            min_delta: Self::DEFAULT_MIN_DELTA,
            best: f64::INFINITY,
            wait: 0,
            lr: initial_lr,
        }
    }

    /// 現在の学習率
    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// エポック終了時に呼ぶ。学習率を下げた場合は新しい値を返す
    pub fn update(&mut self, val_loss: f64) -> Option<f64> {
        if val_loss < self.best - self.min_delta {
            self.best = val_loss;
            self.wait = 0;
            return None;
        }

        self.wait += 1;
        if self.wait < self.patience {
            return None;
        }

        self.wait = 0;
        if self.lr <= self.min_lr {
            return None;
        }
        let new_lr = (self.lr * self.factor).max(self.min_lr);
        self.lr = new_lr;
        Some(new_lr)
    }
}
