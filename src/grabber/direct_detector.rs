use super::{GrabSettings, GrabState, ImageGrabber};
use crate::context::{timestamp, ScanContext, Stamp, StatusChannel, Timing};
use crate::error::ScanError;
use crate::pv::Pv;
use crate::utils::pause;
use log::debug;

/// Grabber for the direct electron detector.
///
/// The detector streams into an external file writer; a "grab" names the
/// output, switches the writer on for `GRABIMAGES:DATATIME` and off again.
/// The writer IOC occasionally misses a single command, so every command is
/// sent twice.
pub struct DirectDetectorGrabber {
    camera: String,
    expname: String,
    extras: String,
    settings: GrabSettings,
    state: GrabState,
    command: Pv,
    writer_status: Pv,
    path: Pv,
    status: StatusChannel,
    timing: Timing,
}

impl DirectDetectorGrabber {
    pub fn new(ctx: &ScanContext, camera: &str, expname: &str, settings: GrabSettings) -> Self {
        let writer = ctx.direct_detector();
        Self {
            camera: camera.to_string(),
            expname: expname.to_string(),
            extras: String::new(),
            settings,
            state: GrabState::Idle,
            command: ctx.pv(&writer.command_pv),
            writer_status: ctx.pv(&writer.status_pv),
            path: ctx.pv(&writer.path_pv),
            status: ctx.status().clone(),
            timing: ctx.timing().clone(),
        }
    }

    /// Writer output path relative to its data root:
    /// `<date>/<expname>/<extras>_<timestamp>`.
    pub fn output_template(&self) -> String {
        format!(
            "{}/{}/{}_{}",
            timestamp(Stamp::Date),
            self.expname,
            self.extras.trim_start_matches('_'),
            timestamp(Stamp::Micros)
        )
    }

    fn writer_on(&self) -> bool {
        let on = self.writer_status.get_bool();
        self.status.print_msg(&format!(
            "DataWriter status is: {}",
            if on { "ON" } else { "OFF" }
        ));
        on
    }

    fn send_twice(&self, value: i64) -> Result<(), ScanError> {
        for _ in 0..2 {
            self.command.put(value)?;
            pause(self.timing.writer_toggle);
        }
        Ok(())
    }
}

impl ImageGrabber for DirectDetectorGrabber {
    fn camera(&self) -> &str {
        &self.camera
    }

    fn settings(&self) -> &GrabSettings {
        &self.settings
    }

    fn state(&self) -> GrabState {
        self.state
    }

    fn filename_extras(&self) -> &str {
        &self.extras
    }

    fn set_filename_extras(&mut self, extras: String) {
        self.extras = extras;
    }

    fn grab_images(&mut self, _count: Option<u32>) -> Result<(), ScanError> {
        self.state = GrabState::Arming;
        let template = self.output_template();
        self.path.put_str(&template)?;
        self.status.print_msg(&format!(
            "Writing {} data for {} seconds...",
            self.camera,
            self.settings.data_time.as_secs_f64()
        ));
        self.status
            .print_raw(&format!("DirectD filepath: {}", template));

        self.state = GrabState::Capturing;
        self.send_twice(1)?;
        self.writer_on();
        pause(self.settings.data_time);

        self.state = GrabState::Writing;
        self.send_twice(0)?;
        self.writer_on();
        self.status
            .print_msg(&format!("Done Writing {} data.", self.camera));
        self.state = GrabState::Idle;
        Ok(())
    }

    fn wait_for_new_image(&mut self) -> Result<(), ScanError> {
        debug!("{}: no frame counter, not waiting", self.camera);
        Ok(())
    }

    fn stop_acquire(&mut self) -> Result<(), ScanError> {
        Ok(())
    }

    fn abort(&mut self) -> Result<(), ScanError> {
        self.state = GrabState::Aborted;
        self.send_twice(0)
    }

    fn monitor_pvs(&self) -> Vec<Pv> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pv::PvValue;
    use crate::testing::sim_context;

    #[test]
    fn test_grab_toggles_writer_twice() {
        let (sim, ctx) = sim_context();
        let mut grabber = DirectDetectorGrabber::new(&ctx, "UED:DirectD", "graphene", GrabSettings::default());
        grabber.set_filename_extras("_Static_delay-001".to_string());
        grabber.grab_images(None).unwrap();

        assert_eq!(
            sim.writes_to("UED:TST:FILEWRITER:CMD"),
            vec![PvValue::Int(1), PvValue::Int(1), PvValue::Int(0), PvValue::Int(0)]
        );
        let path = sim.value("UED:TST:FILEWRITER:PATH").unwrap().as_string();
        let parts: Vec<&str> = path.split('/').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1], "graphene");
        assert!(parts[2].starts_with("Static_delay-001_"));
    }

    #[test]
    fn test_abort_stops_writer() {
        let (sim, ctx) = sim_context();
        let mut grabber = DirectDetectorGrabber::new(&ctx, "UED:DirectD", "x", GrabSettings::default());
        grabber.abort().unwrap();
        assert_eq!(
            sim.writes_to("UED:TST:FILEWRITER:CMD"),
            vec![PvValue::Int(0), PvValue::Int(0)]
        );
        assert_eq!(grabber.state(), GrabState::Aborted);
    }
}
