/// Fader changes that wait for held notes to be released.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PendingChange {
    pub volume: Option<f32>,
    pub pan: Option<f32>,
    pub muted: Option<bool>,
}

impl PendingChange {
    pub fn volume(volume: f32) -> Self {
        Self {
            volume: Some(volume),
            ..Default::default()
        }
    }

    pub fn pan(pan: f32) -> Self {
        Self {
            pan: Some(pan),
            ..Default::default()
        }
    }

    pub fn muted(muted: bool) -> Self {
        Self {
            muted: Some(muted),
            ..Default::default()
        }
    }

    /// Later values win field by field.
    pub fn merge(&mut self, other: PendingChange) {
        self.volume = other.volume.or(self.volume);
        self.pan = other.pan.or(self.pan);
        self.muted = other.muted.or(self.muted);
    }

    pub fn is_empty(&self) -> bool {
        self.volume.is_none() && self.pan.is_none() && self.muted.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum Spillover {
    #[default]
    Live,
    Pending(PendingChange),
}

impl Spillover {
    /// Returns the change if it should be applied now, `None` if it was queued.
    pub fn submit(&mut self, change: PendingChange, defer: bool) -> Option<PendingChange> {
        if !defer {
            return Some(change);
        }
        match self {
            Spillover::Live => *self = Spillover::Pending(change),
            Spillover::Pending(pending) => pending.merge(change),
        }
        None
    }

    /// Leaves `Pending`, handing back everything queued.
    pub fn release(&mut self) -> Option<PendingChange> {
        match std::mem::take(self) {
            Spillover::Live => None,
            Spillover::Pending(pending) => Some(pending),
        }
    }

    pub fn discard(&mut self) {
        *self = Spillover::Live;
    }

    pub fn pending(&self) -> Option<&PendingChange> {
        match self {
            Spillover::Live => None,
            Spillover::Pending(pending) => Some(pending),
        }
    }
}
