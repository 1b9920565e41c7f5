// Value Printer - Logs its input whenever it changes

use sight_data::Object;
use sight_service::{AutoConnections, Declarations, Service, ServiceContext, ServiceResult, slots};

pub const VALUE_KEY: &str = "value";
pub const PRINT_SLOT: &str = "print";

#[derive(Debug, Default)]
pub struct ValuePrinter {
    prefix: String,
    /// Lines printed since start
    printed: usize,
}

impl ValuePrinter {
    pub fn printed(&self) -> usize {
        self.printed
    }

    fn print(&mut self, ctx: &ServiceContext, line: &str) {
        self.printed += 1;
        if self.prefix.is_empty() {
            tracing::info!(service = %ctx.uid(), "{line}");
        } else {
            tracing::info!(service = %ctx.uid(), "{}: {line}", self.prefix);
        }
    }
}

impl Service for ValuePrinter {
    fn declare(&mut self, decl: &mut Declarations<'_, Self>) {
        decl.slot(PRINT_SLOT, |printer: &mut ValuePrinter, ctx: &ServiceContext, message: String| {
            printer.print(ctx, &message);
            Ok(())
        });
    }

    fn configuring(&mut self, ctx: &ServiceContext) -> ServiceResult<()> {
        self.prefix = ctx.config().get_or("prefix", String::new())?;
        Ok(())
    }

    fn starting(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        self.printed = 0;
        Ok(())
    }

    fn updating(&mut self, ctx: &ServiceContext) -> ServiceResult<()> {
        // Nothing bound yet is not an error for a printer
        let Some(object) = ctx.input(VALUE_KEY) else {
            tracing::debug!(service = %ctx.uid(), "No value to print");
            return Ok(());
        };
        let line = format!("{} = {}", object.uid(), object.snapshot());
        self.print(ctx, &line);
        Ok(())
    }

    fn stopping(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }

    fn auto_connections(&self) -> AutoConnections {
        AutoConnections::new().with(VALUE_KEY, Object::MODIFIED_SIG, slots::UPDATE)
    }
}
