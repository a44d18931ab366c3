use wallet_update_agent_core::ComponentId;

/// Requests understood by the device's command executor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    GetFeatures,
    RebootToBootloader,
    /// Prepares the device to receive `length` bytes of firmware for `component`.
    FirmwareErase {
        component: ComponentId,
        length: u32,
    },
    FirmwareUpload {
        data: Vec<u8>,
    },
    DfuStart {
        component: ComponentId,
        size: u32,
    },
    DfuSelect,
    DfuCreate {
        size: u32,
    },
    DfuWrite {
        data: Vec<u8>,
    },
    DfuChecksum,
    DfuExecute,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::GetFeatures => "get_features",
            Command::RebootToBootloader => "reboot_to_bootloader",
            Command::FirmwareErase { .. } => "firmware_erase",
            Command::FirmwareUpload { .. } => "firmware_upload",
            Command::DfuStart { .. } => "dfu_start",
            Command::DfuSelect => "dfu_select",
            Command::DfuCreate { .. } => "dfu_create",
            Command::DfuWrite { .. } => "dfu_write",
            Command::DfuChecksum => "dfu_checksum",
            Command::DfuExecute => "dfu_execute",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Success,
    Features(Features),
    /// The device asks for the next slice of the image during a wired upload.
    FirmwareRequest {
        offset: u32,
        length: u32,
    },
    DfuObjectInfo {
        max_size: u32,
        offset: u32,
        crc: u32,
    },
    DfuChecksum {
        offset: u32,
        crc: u32,
    },
    Failure {
        code: RejectCode,
        message: String,
    },
}

/// Device state as reported by `GetFeatures`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Features {
    pub firmware_version: Option<String>,
    pub bootloader_version: Option<String>,
    pub radio_version: Option<String>,
    pub bootloader_mode: bool,
    pub initialized: bool,
    pub needs_backup: bool,
}

impl Features {
    /// The running version of `component`. In bootloader mode the main firmware is not
    /// running and nothing is reported for it.
    pub fn version_of(&self, component: ComponentId) -> Option<&str> {
        match component {
            ComponentId::Main if self.bootloader_mode => None,
            ComponentId::Main => self.firmware_version.as_deref(),
            ComponentId::Radio => self.radio_version.as_deref(),
        }
    }
}

/// Why the device refused a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectCode {
    /// The image failed the device's own validation.
    InvalidImage,
    NotInBootloader,
    /// The user aborted on the device.
    ActionCancelled,
    Busy,
    Other(u32),
}

impl RejectCode {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => RejectCode::InvalidImage,
            2 => RejectCode::NotInBootloader,
            4 => RejectCode::ActionCancelled,
            5 => RejectCode::Busy,
            other => RejectCode::Other(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            RejectCode::InvalidImage => 1,
            RejectCode::NotInBootloader => 2,
            RejectCode::ActionCancelled => 4,
            RejectCode::Busy => 5,
            RejectCode::Other(code) => code,
        }
    }
}
