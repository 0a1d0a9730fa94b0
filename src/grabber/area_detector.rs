use super::{tiff_tags, GrabSettings, GrabState, ImageGrabber};
use crate::context::{timestamp, ScanContext, Stamp, StatusChannel, Timing};
use crate::error::ScanError;
use crate::pv::Pv;
use crate::utils::{pause, poll_until, PollError};
use log::{debug, warn};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

/// How frames are turned into files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// One capture-and-wait per image with a fresh time-stamped template
    Individual,
    /// One capture command for the whole burst
    Buffered,
    /// Single-shot loop for cameras that cannot free-run while capturing
    CaptureBeforeAcquire,
}

impl CaptureMode {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => CaptureMode::Buffered,
            2 => CaptureMode::CaptureBeforeAcquire,
            _ => CaptureMode::Individual,
        }
    }
}

const ANDOR_SETTINGS: &[&str] = &[
    "cam1:BI:NAME.DESC",
    "cam1:AcquireTime_RBV",
    "cam1:AndorEMGain_RBV",
    "cam1:AndorEMGainMode_RBV",
    "cam1:TriggerMode_RBV",
    "cam1:ImageMode_RBV",
    "cam1:ArrayRate_RBV",
    "cam1:DataType_RBV",
    "cam1:ArraySizeX_RBV",
    "cam1:ArraySizeY_RBV",
    "cam1:AndorADCSpeed_RBV",
    "cam1:AndorPreAmpGain_RBV",
    "cam1:ShutterStatus_RBV",
    "cam1:AndorCooler",
    "cam1:TemperatureActual",
];

const DEFAULT_SETTINGS: &[&str] = &[
    "cam1:BI:NAME.DESC",
    "cam1:AcquireTime_RBV",
    "cam1:Gain_RBV",
    "cam1:TriggerMode_RBV",
    "cam1:ArrayRate_RBV",
    "cam1:DataType_RBV",
    "cam1:ColorMode_RBV",
    "cam1:ArraySizeX_RBV",
    "cam1:ArraySizeY_RBV",
];

/// Camera driver and file plugin records.
#[derive(Debug, Clone)]
struct PluginPvs {
    enable_callbacks: Pv,
    file_path: Pv,
    file_name: Pv,
    auto_increment: Pv,
    file_write_mode: Pv,
    auto_save: Pv,
    file_number: Pv,
    num_capture: Pv,
    queue_size: Pv,
    template: Pv,
    capture: Pv,
    capture_rbv: Pv,
    writing_rbv: Pv,
    last_image: Pv,
    timestamp_rbv: Pv,
    acquire: Pv,
    acquire_rbv: Pv,
    image_mode: Pv,
    num_exposures: Pv,
    array_counter: Pv,
}

impl PluginPvs {
    fn new(ctx: &ScanContext, camera: &str, plugin: &str) -> Self {
        let plug = |field: &str| ctx.pv(&format!("{}:{}:{}", camera, plugin, field));
        let cam = |field: &str| ctx.pv(&format!("{}:cam1:{}", camera, field));
        Self {
            enable_callbacks: plug("EnableCallbacks"),
            file_path: plug("FilePath"),
            file_name: plug("FileName"),
            auto_increment: plug("AutoIncrement"),
            file_write_mode: plug("FileWriteMode"),
            auto_save: plug("AutoSave"),
            file_number: plug("FileNumber"),
            num_capture: plug("NumCapture"),
            queue_size: plug("QueueSize"),
            template: plug("FileTemplate"),
            capture: plug("Capture"),
            capture_rbv: plug("Capture_RBV.RVAL"),
            writing_rbv: plug("WriteFile_RBV.RVAL"),
            last_image: plug("FullFileName_RBV"),
            timestamp_rbv: plug("TimeStamp_RBV"),
            acquire: cam("Acquire"),
            acquire_rbv: cam("Acquire_RBV.RVAL"),
            image_mode: cam("ImageMode"),
            num_exposures: cam("NumExposures"),
            array_counter: cam("ArrayCounter_RBV"),
        }
    }
}

/// Grabber for an areaDetector IOC with a file-saving plugin.
pub struct AreaDetectorGrabber {
    camera: String,
    file_ext: &'static str,
    image_dir: String,
    file_name_prefix: String,
    extras: String,
    settings: GrabSettings,
    settings_pvs: Vec<Pv>,
    image_files: Vec<String>,
    state: GrabState,
    pvs: PluginPvs,
    image_filepath_pv: Pv,
    capture_link_pv: Pv,
    status: StatusChannel,
    timing: Timing,
}

impl AreaDetectorGrabber {
    /// `filepath` is the experiment directory; images go to
    /// `<filepath>images-<camera>/`.
    pub fn new(
        ctx: &ScanContext,
        camera: &str,
        filepath: &str,
        plugin: &str,
        settings: GrabSettings,
    ) -> Self {
        let file_ext = match plugin {
            "TIFF1" => ".tif",
            "JPEG1" => ".jpg",
            _ => ".img",
        };
        let settings_list = if camera.contains("ANDOR") {
            ANDOR_SETTINGS
        } else {
            DEFAULT_SETTINGS
        };
        let mut image_dir = filepath.to_string();
        if !image_dir.is_empty() && !image_dir.ends_with('/') {
            image_dir.push('/');
        }
        image_dir.push_str(&format!("images-{}/", camera));

        Self {
            camera: camera.to_string(),
            file_ext,
            image_dir,
            file_name_prefix: camera.to_string(),
            extras: String::new(),
            settings,
            settings_pvs: settings_list
                .iter()
                .map(|field| ctx.pv(&format!("{}:{}", camera, field)))
                .collect(),
            image_files: Vec::new(),
            state: GrabState::Idle,
            pvs: PluginPvs::new(ctx, camera, plugin),
            image_filepath_pv: ctx.config_pv("IMAGE:FILEPATH"),
            capture_link_pv: ctx.config_pv("GRABIMAGES:CAPTURE_RBV.INP"),
            status: ctx.status().clone(),
            timing: ctx.timing().clone(),
        }
    }

    pub fn image_dir(&self) -> &str {
        &self.image_dir
    }

    /// Files recorded for time-stamp renaming during the last grab.
    pub fn image_files(&self) -> &[String] {
        &self.image_files
    }

    /// Turn acquisition on if the camera is not already acquiring.
    fn set_acquire(&self) -> Result<(), ScanError> {
        debug!("{}: acquiring: {:?}", self.camera, self.pvs.acquire_rbv.get());
        if self.pvs.acquire_rbv.get_bool() {
            return Ok(());
        }
        debug!("{}: turning acquisition on", self.camera);
        self.pvs.acquire.put(1)?;
        pause(self.timing.camera_retry);
        if !self.pvs.acquire_rbv.get_bool() {
            self.status.fail("Camera not acquiring");
            return Err(ScanError::CameraNotAcquiring(self.camera.clone()));
        }
        Ok(())
    }

    /// Poll `done` until it holds or `timeout` passes. Expiry is logged and
    /// the caller proceeds.
    fn wait_for<F>(&self, what: &str, timeout: Duration, mut done: F) -> bool
    where
        F: FnMut() -> bool,
    {
        match poll_until(|| Ok::<bool, ()>(done()), timeout, self.timing.capture_poll) {
            Ok(()) => true,
            Err(PollError::Timeout) | Err(PollError::ConditionError(())) => {
                warn!(
                    "{}: {} not reached within {:.1} s, continuing",
                    self.camera,
                    what,
                    timeout.as_secs_f64()
                );
                false
            }
        }
    }

    fn wait_capture_done(&self) -> bool {
        self.wait_for("capture complete", self.timing.grab_timeout, || {
            !(self.pvs.capture_rbv.get_bool() || self.pvs.writing_rbv.get_bool())
        })
    }

    fn wait_new_frame(&self) -> Result<(), ScanError> {
        let saved_msg = self.status.msg_pv().get_string();
        self.set_acquire()?;
        if let Some(count0) = self.pvs.array_counter.get_f64() {
            debug!("{}: array count before wait: {}", self.camera, count0);
            self.status.print_msg("Waiting for new image...");
            self.wait_for("new image", self.timing.new_image_timeout, || {
                self.pvs.array_counter.get_f64() != Some(count0)
            });
        }
        if let Some(msg) = saved_msg {
            self.status.msg_pv().put(msg)?;
        }
        Ok(())
    }

    fn timestamped_template(&self) -> String {
        format!("%s%s_{}_%4.4d{}", timestamp(Stamp::Micros), self.file_ext)
    }

    fn record_last_image(&mut self) {
        if self.settings.tiff_timestamps {
            pause(self.timing.template);
            if let Some(file) = self.pvs.last_image.get_string() {
                self.image_files.push(file);
            }
        }
    }

    fn buffered_capture(&mut self, count: u32) -> Result<(), ScanError> {
        debug!("{}: buffered capture", self.camera);
        self.set_acquire()?;
        self.pvs.num_capture.put(count)?;
        self.pvs.queue_size.put(count)?;
        self.pvs
            .template
            .put_str(&format!("%s%s_%4.4d{}", self.file_ext))?;
        if self.settings.wait_new {
            self.wait_new_frame()?;
        }
        debug!("{}: capturing, QueueSize={}", self.camera, count);
        self.pvs.capture.put_wait(1)?;
        if self.settings.tiff_timestamps {
            self.image_files = (1..=count)
                .map(|n| {
                    format!(
                        "{}{}{}_{:04}{}",
                        self.image_dir, self.file_name_prefix, self.extras, n, self.file_ext
                    )
                })
                .collect();
        }
        self.state = GrabState::Writing;
        self.wait_capture_done();
        Ok(())
    }

    fn individual_capture(&mut self, count: u32) -> Result<(), ScanError> {
        debug!("{}: individual capture", self.camera);
        self.set_acquire()?;
        self.pvs.num_capture.put(1)?;
        if self.settings.wait_new {
            self.wait_new_frame()?;
        }
        for _ in 0..count {
            self.pvs.template.put_str_wait(&self.timestamped_template())?;
            pause(self.timing.template);
            self.pvs.capture.put_wait(1)?;
            self.record_last_image();
        }
        self.state = GrabState::Writing;
        Ok(())
    }

    fn capture_before_acquire(&mut self, count: u32) -> Result<(), ScanError> {
        debug!("{}: capture-before-acquire", self.camera);
        if self.pvs.acquire.get_bool() {
            self.pvs.acquire.put(0)?;
        }
        self.wait_for("acquisition off", self.timing.grab_timeout, || {
            !self.pvs.acquire.get_bool()
        });

        let image_mode = self.pvs.image_mode.get();
        self.pvs.image_mode.put(0)?;
        self.pvs.num_exposures.put(1)?;
        self.pvs.num_capture.put(1)?;

        let result = (0..count).try_for_each(|_| self.single_shot());

        if let Some(mode) = image_mode {
            self.pvs.image_mode.put(mode)?;
        }
        self.state = GrabState::Writing;
        result
    }

    fn single_shot(&mut self) -> Result<(), ScanError> {
        self.pvs.template.put_str(&self.timestamped_template())?;
        self.pvs.capture.put(1)?;
        self.wait_for("capture armed", self.timing.grab_timeout, || {
            self.pvs.capture.get_f64() == Some(1.0)
        });
        self.pvs.acquire.put(1)?;
        self.wait_capture_done();
        self.pvs.acquire.put(0)?;
        self.wait_for("acquisition off", self.timing.grab_timeout, || {
            !self.pvs.acquire.get_bool()
        });
        self.record_last_image();
        Ok(())
    }

    fn write_camera_settings(&self) -> Result<(), ScanError> {
        let path = format!(
            "{}cameraSettings-{}-{}.txt",
            self.image_dir,
            self.camera,
            timestamp(Stamp::Seconds)
        );
        let mut file = File::create(&path)
            .map_err(|e| ScanError::io(e, format!("creating {}", path)))?;
        let mut text = format!(
            "Camera settings for {}\n{}\n{}\n",
            self.camera,
            timestamp(Stamp::Seconds),
            "-".repeat(59)
        );
        for pv in &self.settings_pvs {
            let value = pv.get_string().unwrap_or_else(|| "None".to_string());
            text.push_str(&format!("{} {}\n", pv.name(), value));
        }
        text.push('\n');
        file.write_all(text.as_bytes())
            .map_err(|e| ScanError::io(e, format!("writing {}", path)))
    }

    fn write_tiff_tags(&mut self) {
        self.status
            .print_msg("Timestamping filenames from Tiff tags...");
        let prefix = format!("{}{}", self.file_name_prefix, self.extras);
        for file in std::mem::take(&mut self.image_files) {
            let path = Path::new(&file);
            if !path.exists() {
                continue;
            }
            match tiff_tags::retag(path, &prefix) {
                Ok(new_path) => self.status.print_raw(&format!(
                    "{} --> {}",
                    path.file_name().and_then(|n| n.to_str()).unwrap_or(&file),
                    new_path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
                )),
                Err(e) => warn!("Skipping time-stamp rename: {}", e),
            }
        }
    }

    fn run_grab(&mut self, count: u32) -> Result<(), ScanError> {
        self.status
            .print_msg(&format!("Grabbing {} images from {}...", count, self.camera));

        self.state = GrabState::Arming;
        self.pvs.enable_callbacks.put(1)?;
        self.pvs.file_path.put_str(&self.image_dir)?;
        self.pvs
            .file_name
            .put_str(&format!("{}{}", self.file_name_prefix, self.extras))?;
        self.pvs.auto_increment.put(1)?;
        // Stream mode; Capture mode is going away in areaDetector
        self.pvs.file_write_mode.put(2)?;
        self.pvs.auto_save.put(1)?;
        self.pvs.file_number.put(1)?;

        self.state = GrabState::Capturing;
        match self.settings.capture_mode {
            CaptureMode::Buffered => self.buffered_capture(count)?,
            CaptureMode::CaptureBeforeAcquire => self.capture_before_acquire(count)?,
            CaptureMode::Individual => self.individual_capture(count)?,
        }

        self.write_camera_settings()?;
        if self.settings.tiff_timestamps {
            self.write_tiff_tags();
        }
        self.status.print_sleep(
            self.timing.grab_pause,
            &format!("Grabbed {} images from {}: Pausing", count, self.camera),
        );
        Ok(())
    }
}

impl ImageGrabber for AreaDetectorGrabber {
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

    fn grab_images(&mut self, count: Option<u32>) -> Result<(), ScanError> {
        let count = count.filter(|&n| n > 0).unwrap_or(self.settings.count);
        self.image_files.clear();
        let result = self.run_grab(count);
        self.state = GrabState::Idle;
        result
    }

    fn wait_for_new_image(&mut self) -> Result<(), ScanError> {
        self.wait_new_frame()
    }

    fn stop_acquire(&mut self) -> Result<(), ScanError> {
        debug!("{}: turning acquisition off", self.camera);
        self.pvs.acquire.put(0)
    }

    fn abort(&mut self) -> Result<(), ScanError> {
        self.state = GrabState::Aborted;
        self.pvs.capture.put(0)
    }

    fn monitor_pvs(&self) -> Vec<Pv> {
        vec![self.pvs.timestamp_rbv.clone(), self.pvs.capture_rbv.clone()]
    }

    fn prepare_output(&self, create: bool) -> Result<(), ScanError> {
        self.capture_link_pv
            .put_str(&format!("{} CPP", self.pvs.capture_rbv.name()))?;
        if create {
            let dir = Path::new(&self.image_dir);
            if dir.exists() {
                self.status.fail("Filepath already exists");
                return Err(ScanError::FilepathExists(dir.to_path_buf()));
            }
            std::fs::create_dir_all(dir)
                .map_err(|e| ScanError::io(e, format!("creating {}", self.image_dir)))?;
        }
        self.image_filepath_pv.put_str(&self.image_dir)
    }
}
