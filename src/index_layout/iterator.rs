use super::LayoutError;
use crate::layout::{Region, RegionKind};

/// Walks the regions of a table, checking each one sits exactly where the
/// layout expects it.
///
/// The first mismatch faults the iterator, every later call returns that
/// same error so the original cause is never masked by a knock-on failure.
pub(super) struct RegionIterator<'a> {
    regions: &'a [Region],
    next: usize,
    next_block: u64,
    context: &'static str,
    fault: Option<String>,
}

impl<'a> RegionIterator<'a> {
    pub(super) fn new(regions: &'a [Region], start_block: u64, context: &'static str) -> Self {
        Self {
            regions,
            next: 0,
            next_block: start_block,
            context,
            fault: None,
        }
    }

    #[inline]
    /// The block the next region is expected to start at.
    pub(super) fn next_block(&self) -> u64 {
        self.next_block
    }

    /// The next region, if the iterator has not faulted.
    pub(super) fn peek(&self) -> Option<&Region> {
        if self.fault.is_some() {
            return None;
        }
        self.regions.get(self.next)
    }

    /// Consume the next region, advancing the expected block by its length.
    pub(super) fn expect_region(
        &mut self,
        kind: RegionKind,
        instance: u16,
        num_blocks: Option<u64>,
    ) -> Result<Region, LayoutError> {
        let region = self.take(kind, instance, num_blocks)?;
        self.next_block += region.num_blocks;
        Ok(region)
    }

    /// Consume the next region as a container of the regions after it.
    ///
    /// The expected block does not advance, the container's children must
    /// fill it exactly, see [Self::finish_container].
    pub(super) fn expect_container(
        &mut self,
        kind: RegionKind,
        instance: u16,
    ) -> Result<Region, LayoutError> {
        self.take(kind, instance, None)
    }

    /// Check the regions read since `container` exactly fill it.
    pub(super) fn finish_container(&mut self, container: &Region) -> Result<(), LayoutError> {
        self.check_faulted()?;
        if self.next_block != container.end_block() {
            return self.fault(format!(
                "{:?} container ends at block {} but its regions end at {}",
                container.kind,
                container.end_block(),
                self.next_block,
            ));
        }
        Ok(())
    }

    /// Check every region has been consumed and they end at `end_block`.
    pub(super) fn finish(mut self, end_block: u64) -> Result<(), LayoutError> {
        self.check_faulted()?;
        if self.next != self.regions.len() {
            let remaining = self.regions.len() - self.next;
            return self.fault(format!("{remaining} unexpected trailing regions"));
        }
        if self.next_block != end_block {
            return self.fault(format!(
                "regions end at block {} but table ends at {end_block}",
                self.next_block,
            ));
        }
        Ok(())
    }

    fn take(
        &mut self,
        kind: RegionKind,
        instance: u16,
        num_blocks: Option<u64>,
    ) -> Result<Region, LayoutError> {
        self.check_faulted()?;

        let Some(region) = self.regions.get(self.next).copied() else {
            return self.fault(format!("missing {kind:?} region (instance {instance})"));
        };

        if region.kind != kind || region.instance != instance {
            return self.fault(format!(
                "expected {kind:?} region (instance {instance}) but found {:?} (instance {})",
                region.kind, region.instance,
            ));
        }
        if region.start_block != self.next_block {
            return self.fault(format!(
                "{kind:?} region starts at block {} but expected {}",
                region.start_block, self.next_block,
            ));
        }
        if num_blocks.is_some_and(|expected| expected != region.num_blocks) {
            let expected = num_blocks.unwrap_or_default();
            return self.fault(format!(
                "{kind:?} region has {} blocks but expected {expected}",
                region.num_blocks,
            ));
        }

        self.next += 1;
        Ok(region)
    }

    fn check_faulted(&self) -> Result<(), LayoutError> {
        match self.fault.as_ref() {
            Some(reason) => Err(self.error(reason.clone())),
            None => Ok(()),
        }
    }

    fn fault<T>(&mut self, reason: String) -> Result<T, LayoutError> {
        tracing::error!(context = self.context, reason = %reason, "region table mismatch");
        let error = self.error(reason.clone());
        self.fault = Some(reason);
        Err(error)
    }

    fn error(&self, reason: String) -> LayoutError {
        LayoutError::BadLayout {
            context: self.context,
            reason,
        }
    }
}
