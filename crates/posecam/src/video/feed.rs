use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
};

use crate::{
    error::Unavailable,
    frame::{DisplaySize, Frame, FrameSource},
    image::Image,
};

/// Callback invoked on the capture thread for every captured frame.
pub type FrameHook = Box<dyn FnMut(&Arc<Image>) + Send>;

#[derive(Default)]
struct Slot {
    latest: Option<Arc<Image>>,
    detached: bool,
}

/// A [`FrameSource`] fed by a background capture thread.
///
/// The capture thread reads frames as fast as the device delivers them and only keeps the most
/// recent one. When the reader fails, the feed is detached and the thread exits. Dropping the
/// feed stops the thread after its current read.
pub struct LiveFeed {
    slot: Arc<Mutex<Slot>>,
    stop: Arc<AtomicBool>,
    display: DisplaySize,
}

impl LiveFeed {
    /// Spawns a capture thread that calls `read` in a loop.
    pub fn spawn<R>(
        name: &str,
        mut read: R,
        display: DisplaySize,
        mut hook: Option<FrameHook>,
    ) -> anyhow::Result<Self>
    where
        R: FnMut() -> anyhow::Result<Image> + Send + 'static,
    {
        let slot = Arc::new(Mutex::new(Slot::default()));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_name = name.to_string();
        let (slot2, stop2) = (slot.clone(), stop.clone());
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                log::trace!("capture thread '{thread_name}' started");
                while !stop2.load(Ordering::Relaxed) {
                    match read() {
                        Ok(image) => {
                            let image = Arc::new(image);
                            if let Some(hook) = &mut hook {
                                hook(&image);
                            }
                            slot2.lock().unwrap().latest = Some(image);
                        }
                        Err(e) => {
                            log::error!("capture thread '{thread_name}' failed: {e:#}");
                            break;
                        }
                    }
                }
                slot2.lock().unwrap().detached = true;
                log::debug!("capture thread '{thread_name}' exiting");
            })?;

        Ok(Self {
            slot,
            stop,
            display,
        })
    }

    pub fn display_size(&self) -> &DisplaySize {
        &self.display
    }
}

impl FrameSource for LiveFeed {
    fn current_frame(&self) -> Result<Frame, Unavailable> {
        let slot = self.slot.lock().unwrap();
        if slot.detached {
            return Err(Unavailable::Detached);
        }
        match &slot.latest {
            Some(image) => Ok(Frame::new(image.clone(), self.display.get())),
            None => Err(Unavailable::NotAttached),
        }
    }
}

impl Drop for LiveFeed {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, time::Duration};

    use anyhow::bail;

    use crate::resolution::Resolution;

    use super::*;

    fn wait_until(feed: &LiveFeed, pred: impl Fn(&Result<Frame, Unavailable>) -> bool) {
        for _ in 0..500 {
            if pred(&feed.current_frame()) {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("timed out waiting for feed state");
    }

    #[test]
    fn not_attached_until_first_frame() {
        let (tx, rx) = mpsc::channel::<Image>();
        let feed = LiveFeed::spawn(
            "test-feed",
            move || Ok(rx.recv()?),
            DisplaySize::new(Resolution::new(2, 2)),
            None,
        )
        .unwrap();

        assert_eq!(feed.current_frame().unwrap_err(), Unavailable::NotAttached);

        tx.send(Image::new(4, 4)).unwrap();
        wait_until(&feed, |f| f.is_ok());
        let frame = feed.current_frame().unwrap();
        assert_eq!(frame.native(), Resolution::new(4, 4));
        assert_eq!(frame.display(), Resolution::new(2, 2));

        // The same frame is returned again while no new one has arrived.
        let again = feed.current_frame().unwrap();
        assert!(Arc::ptr_eq(frame.shared_image(), again.shared_image()));

        // Closing the channel makes the reader fail, which detaches the feed.
        drop(tx);
        wait_until(&feed, |f| matches!(f, Err(Unavailable::Detached)));
    }

    #[test]
    fn hook_sees_every_frame() {
        let (seen_tx, seen_rx) = mpsc::channel();
        let mut remaining = 3;
        let _feed = LiveFeed::spawn(
            "test-hook",
            move || {
                if remaining == 0 {
                    bail!("end of stream");
                }
                remaining -= 1;
                Ok(Image::new(1, 1))
            },
            DisplaySize::default(),
            Some(Box::new(move |image: &Arc<Image>| {
                seen_tx.send(image.resolution()).ok();
            })),
        )
        .unwrap();

        let seen = seen_rx.iter().take(3).count();
        assert_eq!(seen, 3);
    }
}
