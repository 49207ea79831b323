//! # Admission
//!
//! Decides whether a decode result may be written to the processed cache.

use std::fmt;
use std::sync::Arc;

use crate::config::UsagePolicy;
use crate::request::{Artifact, DecodeResult, LoadRequest};

/// Why a result was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The result or the request opted out of caching
    BannedFromCache,
    /// Only raster results are cached
    NotRaster,
    /// The usage policy refused these options
    UnusableForOptions,
    /// No transformation was applied, so the source cache already covers it
    NotProcessed,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::BannedFromCache => "banned from cache",
            Self::NotRaster => "not a raster result",
            Self::UnusableForOptions => "cache unusable for these options",
            Self::NotProcessed => "result was not processed",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Accept,
    Reject(RejectReason),
}

impl AdmissionDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accept)
    }

    pub fn reason(&self) -> Option<RejectReason> {
        match self {
            Self::Accept => None,
            Self::Reject(reason) => Some(*reason),
        }
    }
}

/// Ordered admission rules; the first failing rule decides.
#[derive(Clone)]
pub struct AdmissionPolicy {
    usage: Arc<dyn UsagePolicy>,
}

impl AdmissionPolicy {
    pub fn new(usage: Arc<dyn UsagePolicy>) -> Self {
        Self { usage }
    }

    pub fn should_cache(&self, result: &DecodeResult, request: &LoadRequest) -> AdmissionDecision {
        if result.banned || request.no_cache {
            return AdmissionDecision::Reject(RejectReason::BannedFromCache);
        }

        match &result.artifact {
            Artifact::Raster(_) => {}
            Artifact::Vector { .. } | Artifact::Animated { .. } | Artifact::GifFrame { .. } => {
                return AdmissionDecision::Reject(RejectReason::NotRaster);
            }
        }

        if !self.usage.can_use(&request.options) {
            return AdmissionDecision::Reject(RejectReason::UnusableForOptions);
        }

        if !result.processed {
            return AdmissionDecision::Reject(RejectReason::NotProcessed);
        }

        AdmissionDecision::Accept
    }
}

impl fmt::Debug for AdmissionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionPolicy").finish_non_exhaustive()
    }
}
