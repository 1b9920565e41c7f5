// Matrix Generator - Rotates a transformation matrix on every update
//
// Each update composes the in-out matrix with a rotation about Z, notifies
// the matrix and emits `computed` with the accumulated angle in degrees.

use sight_com::Signal;
use sight_data::Matrix4;
use sight_service::{Declarations, Service, ServiceContext, ServiceResult};

pub const MATRIX_KEY: &str = "matrix";
pub const COMPUTED_SIG: &str = "computed";

#[derive(Debug, Default)]
pub struct MatrixGenerator {
    /// Degrees per update
    step: f64,
    angle: f64,
    computed: Option<Signal<f64>>,
}

impl Service for MatrixGenerator {
    fn declare(&mut self, decl: &mut Declarations<'_, Self>) {
        self.computed = Some(decl.signal(COMPUTED_SIG));
    }

    fn configuring(&mut self, ctx: &ServiceContext) -> ServiceResult<()> {
        self.step = ctx.config().get_or("step", 5.0)?;
        Ok(())
    }

    fn starting(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        self.angle = 0.0;
        Ok(())
    }

    fn updating(&mut self, ctx: &ServiceContext) -> ServiceResult<()> {
        let matrix = ctx.required(MATRIX_KEY)?;
        {
            let mut data = matrix.try_write::<Matrix4>()?;
            *data = Matrix4::rotation_z(self.step.to_radians()).multiply(&data);
        }
        self.angle = (self.angle + self.step) % 360.0;
        matrix.notify_modified();

        if let Some(computed) = &self.computed {
            computed.async_emit(self.angle);
        }
        tracing::debug!(service = %ctx.uid(), angle = self.angle, "Matrix computed");
        Ok(())
    }

    fn stopping(&mut self, _ctx: &ServiceContext) -> ServiceResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sight_com::{HasSignals, Slot};
    use sight_data::Object;
    use sight_service::{ApplicationContext, ServiceConfig, ServiceObject};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_rotates_matrix_and_reports_angle() {
        let app = ApplicationContext::new().unwrap();
        let matrix = Object::new("matrix", Matrix4::identity());
        let generator = app.add_service("generator", MatrixGenerator::default()).unwrap();

        generator
            .set_configuration(ServiceConfig::new(json!({ "step": 90.0 })))
            .unwrap();
        generator.set_object(MATRIX_KEY, Some(matrix.clone()));
        generator.configure().unwrap();
        generator.start().wait().unwrap();

        let last = Arc::new(AtomicU64::new(0));
        let sink = {
            let last = Arc::clone(&last);
            Slot::with_worker(app.default_worker(), move |angle: f64| {
                last.store(angle.to_bits(), Ordering::SeqCst)
            })
        };
        let computed = generator.signals().get::<f64>(COMPUTED_SIG).unwrap();
        let _connection = computed.connect(&sink).unwrap();

        generator.update().wait().unwrap();
        generator.update().wait().unwrap();

        let rotated = *matrix.read::<Matrix4>().unwrap();
        assert!(rotated.approx_eq(&Matrix4::rotation_z(std::f64::consts::PI), 1e-9));
        let point = rotated.transform_point([1.0, 0.0, 0.0]);
        assert!((point[0] + 1.0).abs() < 1e-9);

        app.default_worker().post_task(|| ()).unwrap().wait().unwrap();
        assert_eq!(f64::from_bits(last.load(Ordering::SeqCst)), 180.0);

        app.shutdown();
    }

    #[test]
    fn test_invalid_step_fails_configuration() {
        let app = ApplicationContext::new().unwrap();
        let generator = app.add_service("generator", MatrixGenerator::default()).unwrap();
        generator
            .set_configuration(ServiceConfig::new(json!({ "step": "fast" })))
            .unwrap();

        assert!(generator.configure().is_err());
        app.shutdown();
    }
}
