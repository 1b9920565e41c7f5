// Object Producer - Publishes an output object while started
//
// The object is built by the application's data factory from the `type`
// and optional `value` configuration entries.

use sight_service::{Service, ServiceContext, ServiceError, ServiceResult};

pub const OUTPUT_KEY: &str = "output";

#[derive(Debug, Default)]
pub struct ObjectProducer {
    type_name: String,
    value: Option<serde_json::Value>,
}

impl Service for ObjectProducer {
    fn configuring(&mut self, ctx: &ServiceContext) -> ServiceResult<()> {
        let config = ctx.config();
        self.type_name = config.get_or("type", "Integer".to_string())?;
        self.value = config.get("value").cloned();
        Ok(())
    }

    fn starting(&mut self, ctx: &ServiceContext) -> ServiceResult<()> {
        let app = ctx
            .app()
            .ok_or_else(|| ServiceError::Precondition("application is gone".into()))?;
        let uid = ctx
            .service_config()
            .object(OUTPUT_KEY)
            .map(|binding| binding.uid.clone())
            .unwrap_or_else(|| format!("{}-{OUTPUT_KEY}", ctx.uid()));

        let object = app
            .data_factory()
            .create(&self.type_name, uid.as_str(), self.value.as_ref())?;
        tracing::info!(service = %ctx.uid(), object = %uid, data_type = %self.type_name, "Publishing output");
        ctx.set_output(OUTPUT_KEY, Some(object))
    }

    fn updating(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }

    fn stopping(&mut self, ctx: &ServiceContext) -> ServiceResult<()> {
        ctx.set_output(OUTPUT_KEY, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sight_data::Float;
    use sight_service::{Access, ApplicationContext, ObjectServiceConfig, ServiceConfig, ServiceObject};

    #[test]
    fn test_publishes_and_withdraws_output() {
        let app = ApplicationContext::new().unwrap();
        let producer = app.add_service("producer", ObjectProducer::default()).unwrap();
        producer
            .set_configuration(
                ServiceConfig::new(json!({ "type": "Float", "value": 2.5 }))
                    .with_object(ObjectServiceConfig::new(OUTPUT_KEY, "level", Access::Out)),
            )
            .unwrap();
        producer.configure().unwrap();
        producer.start().wait().unwrap();

        let level = app.registry().output("level").expect("output registered");
        assert_eq!(*level.read::<Float>().unwrap(), Float(2.5));
        assert!(producer.context().output(OUTPUT_KEY).is_some());

        producer.stop().wait().unwrap();
        assert!(app.registry().output("level").is_none());
        assert!(producer.context().output(OUTPUT_KEY).is_none());
        app.shutdown();
    }

    #[test]
    fn test_unknown_type_fails_start() {
        let app = ApplicationContext::new().unwrap();
        let producer = app.add_service("producer", ObjectProducer::default()).unwrap();
        producer
            .set_configuration(ServiceConfig::new(json!({ "type": "Nope" })))
            .unwrap();
        producer.configure().unwrap();

        assert!(producer.start().wait().is_err());
        assert!(producer.is_stopped());
        app.shutdown();
    }
}
