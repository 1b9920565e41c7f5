// Counter - Increments an integer each time it is updated
//
// The counter writes the object it listens to. Its own notification is
// emitted with the auto-connection blocked, so one external modification
// yields exactly one increment.

use sight_data::{Integer, Object};
use sight_service::{AutoConnections, Declarations, Service, ServiceContext, ServiceResult, slots};

pub const VALUE_KEY: &str = "value";
pub const RESET_SLOT: &str = "reset";

#[derive(Debug)]
pub struct Counter {
    step: i64,
}

impl Default for Counter {
    fn default() -> Self {
        Self { step: 1 }
    }
}

impl Counter {
    fn write(ctx: &ServiceContext, f: impl FnOnce(&mut i64)) -> ServiceResult<i64> {
        let object = ctx.required(VALUE_KEY)?;
        let value = {
            let mut data = object.try_write::<Integer>()?;
            f(&mut data.0);
            data.0
        };

        let _blocker = ctx.blocker(&object, Object::MODIFIED_SIG, slots::UPDATE);
        object.notify_modified();
        Ok(value)
    }
}

impl Service for Counter {
    fn declare(&mut self, decl: &mut Declarations<'_, Self>) {
        decl.slot(RESET_SLOT, |_counter: &mut Counter, ctx: &ServiceContext, ()| {
            Self::write(ctx, |value| *value = 0)?;
            tracing::info!(service = %ctx.uid(), "Counter reset");
            Ok(())
        });
    }

    fn configuring(&mut self, ctx: &ServiceContext) -> ServiceResult<()> {
        self.step = ctx.config().get_or("step", 1)?;
        Ok(())
    }

    fn starting(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }

    fn updating(&mut self, ctx: &ServiceContext) -> ServiceResult<()> {
        let step = self.step;
        let value = Self::write(ctx, |value| *value += step)?;
        tracing::debug!(service = %ctx.uid(), value, "Counter incremented");
        Ok(())
    }

    fn stopping(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }

    fn auto_connections(&self) -> AutoConnections {
        AutoConnections::new().with(VALUE_KEY, Object::MODIFIED_SIG, slots::UPDATE)
    }
}
