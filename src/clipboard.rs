use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};

/// Text sink for the "copy" action.
pub trait Clipboard {
    fn write_text(&self, text: &str) -> Result<()>;
}

/// Desktop clipboard through `arboard`. The platform handle is opened on first
/// use and kept alive, since X11 selections vanish when their owner is dropped.
pub struct SystemClipboard {
    handle: Mutex<Option<arboard::Clipboard>>,
}

impl SystemClipboard {
    pub fn new() -> Self {
        SystemClipboard {
            handle: Mutex::new(None),
        }
    }
}

impl Default for SystemClipboard {
    fn default() -> Self {
        SystemClipboard::new()
    }
}

impl Clipboard for SystemClipboard {
    fn write_text(&self, text: &str) -> Result<()> {
        let mut guard = self
            .handle
            .lock()
            .map_err(|_| anyhow!("clipboard lock poisoned"))?;
        if guard.is_none() {
            *guard = Some(arboard::Clipboard::new().context("system clipboard unavailable")?);
        }
        let Some(clipboard) = guard.as_mut() else {
            return Err(anyhow!("system clipboard unavailable"));
        };
        if let Err(err) = clipboard.set_text(text.to_string()) {
            // reopen on the next attempt
            *guard = None;
            return Err(err).context("failed to write the system clipboard");
        }
        Ok(())
    }
}
