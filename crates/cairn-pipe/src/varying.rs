//! Fixed layouts with per-instance number widths.
//!
//! A fixed pipe stores every forced number at the widest size. A varying
//! pipe asks a [`VaryingSizeProvider`] for the width of each forced number
//! instead, so a family of instances with small values can share a
//! narrower fixed layout. Pipes are cached by the chosen width vector.

use std::sync::Arc;

use tracing::debug;

use cairn_types::NumberSize;

use crate::compiler::{forced_fields, VaryingCompiler};
use crate::error::PipeResult;
use crate::pipe::StructPipe;
use crate::schema::Schema;
use crate::value::Instance;

/// One forced number of a fixed layout, in canonical order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VaryingStep<'a> {
    /// Position among the forced numbers.
    pub index: usize,
    pub field: &'a str,
    /// Width the plain fixed layout uses.
    pub max: NumberSize,
}

/// Chooses the width of each forced number.
pub trait VaryingSizeProvider {
    fn width(&mut self, step: &VaryingStep<'_>) -> NumberSize;
}

impl<F> VaryingSizeProvider for F
where
    F: FnMut(&VaryingStep<'_>) -> NumberSize,
{
    fn width(&mut self, step: &VaryingStep<'_>) -> NumberSize {
        self(step)
    }
}

/// Smallest width holding each forced number of one instance.
#[derive(Clone, Copy, Debug)]
pub struct MinimalWidths<'a> {
    instance: &'a Instance,
}

impl<'a> MinimalWidths<'a> {
    pub fn for_instance(instance: &'a Instance) -> Self {
        Self { instance }
    }
}

impl VaryingSizeProvider for MinimalWidths<'_> {
    fn width(&mut self, step: &VaryingStep<'_>) -> NumberSize {
        self.instance
            .get(step.field)
            .and_then(|v| v.as_u64())
            .map_or(step.max, NumberSize::fitting)
    }
}

impl StructPipe {
    /// Fixed pipe whose forced numbers take the widths `sizes` chooses.
    ///
    /// When every width is the maximum the plain fixed pipe is returned.
    pub fn fixed_varying(
        schema: &Arc<Schema>,
        sizes: &mut dyn VaryingSizeProvider,
    ) -> PipeResult<Arc<StructPipe>> {
        let fixed = StructPipe::fixed(schema)?;
        let widths: Vec<NumberSize> = forced_fields(fixed.fields())
            .iter()
            .enumerate()
            .map(|(index, field)| {
                sizes.width(&VaryingStep {
                    index,
                    field: field.name(),
                    max: NumberSize::MAX,
                })
            })
            .collect();

        if widths.iter().all(|w| *w == NumberSize::MAX) {
            debug!(schema = schema.name(), "varying widths are all maximal, using fixed pipe");
            return Ok(fixed);
        }
        StructPipe::of(schema, &VaryingCompiler::new(widths))
    }
}
