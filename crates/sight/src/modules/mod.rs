//! Built-in services
//!
//! Small services used by the demonstration applications. They are made
//! available to application documents by `register_builtin_modules`.

mod counter;
mod matrix_generator;
mod object_producer;
mod timer;
mod value_printer;

pub use counter::Counter;
pub use matrix_generator::MatrixGenerator;
pub use object_producer::ObjectProducer;
pub use timer::Timer;
pub use value_printer::ValuePrinter;

use sight_service::ApplicationContext;

pub const MATRIX_GENERATOR: &str = "sight::modules::MatrixGenerator";
pub const COUNTER: &str = "sight::modules::Counter";
pub const VALUE_PRINTER: &str = "sight::modules::ValuePrinter";
pub const TIMER: &str = "sight::modules::Timer";
pub const OBJECT_PRODUCER: &str = "sight::modules::ObjectProducer";

/// Register every built-in service type with the application's factory
pub fn register_builtin_modules(app: &ApplicationContext) {
    let factory = app.service_factory();
    factory.register_default::<MatrixGenerator>(MATRIX_GENERATOR);
    factory.register_default::<Counter>(COUNTER);
    factory.register_default::<ValuePrinter>(VALUE_PRINTER);
    factory.register_default::<Timer>(TIMER);
    factory.register_default::<ObjectProducer>(OBJECT_PRODUCER);

    tracing::debug!(types = ?factory.types(), "Registered built-in services");
}
