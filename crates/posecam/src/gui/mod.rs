//! The host view: one window per [`Viewer`], showing live video with the pose overlay on top.
//!
//! The winit event loop has to own the main thread, so [`crate::run`] starts it there and runs
//! the application on a worker thread. Viewers talk to the event loop by message passing only.
//! Messages for a viewer whose window was closed are dropped, so late results from a pose loop
//! that is still winding down never reach a window that is gone.

mod renderer;

use std::{
    collections::{HashMap, HashSet},
    panic::{catch_unwind, AssertUnwindSafe},
    process,
    rc::Rc,
    sync::{Arc, Mutex, OnceLock},
};

use winit::{
    event::{Event, WindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopBuilder, EventLoopProxy, EventLoopWindowTarget},
    window::WindowId,
};

use crate::{
    frame::DisplaySize,
    image::{Color, Image},
    overlay::Surface,
    resolution::Resolution,
    termination::Termination,
};

use self::renderer::{Gpu, LayerKind, Renderer, Window};

type CloseHook = Box<dyn FnOnce() + Send>;

enum Msg {
    Register {
        key: String,
        display: DisplaySize,
    },
    OnClose {
        key: String,
        hook: CloseHook,
    },
    Title {
        key: String,
        title: String,
    },
    Video {
        key: String,
        image: Arc<Image>,
    },
    Overlay {
        key: String,
        image: Image,
    },
}

#[derive(Default)]
struct ViewerState {
    display: DisplaySize,
    title: Option<String>,
    on_close: Option<CloseHook>,
    renderer: Option<Renderer>,
}

struct Gui {
    gpu: Rc<Gpu>,
    viewers: HashMap<String, ViewerState>,
    win_id_to_key: HashMap<WindowId, String>,
    closed: HashSet<String>,
}

impl Gui {
    fn new(gpu: Gpu) -> Self {
        Self {
            gpu: Rc::new(gpu),
            viewers: HashMap::new(),
            win_id_to_key: HashMap::new(),
            closed: HashSet::new(),
        }
    }

    fn handle_msg(&mut self, target: &EventLoopWindowTarget<Msg>, msg: Msg) {
        let key = match &msg {
            Msg::Register { key, .. }
            | Msg::OnClose { key, .. }
            | Msg::Title { key, .. }
            | Msg::Video { key, .. }
            | Msg::Overlay { key, .. } => key.clone(),
        };
        if self.closed.contains(&key) {
            log::trace!("dropping message for closed viewer '{key}'");
            return;
        }
        let viewer = self.viewers.entry(key.clone()).or_default();

        match msg {
            Msg::Register { display, .. } => viewer.display = display,
            Msg::OnClose { hook, .. } => viewer.on_close = Some(hook),
            Msg::Title { title, .. } => {
                if let Some(renderer) = &viewer.renderer {
                    renderer.window().win.set_title(&title);
                }
                viewer.title = Some(title);
            }
            Msg::Video { image, .. } => {
                if viewer.renderer.is_none() {
                    match open_window(target, &self.gpu, &key, viewer, image.resolution()) {
                        Ok(renderer) => {
                            self.win_id_to_key
                                .insert(renderer.window().win.id(), key.clone());
                            viewer.renderer = Some(renderer);
                        }
                        Err(e) => {
                            log::error!("failed to open window for '{key}': {e:#}");
                            self.closed.insert(key);
                            return;
                        }
                    }
                }
                if let Some(renderer) = &mut viewer.renderer {
                    renderer.update_layer(LayerKind::Video, image.resolution(), image.data());
                    renderer.window().win.request_redraw();
                }
            }
            Msg::Overlay { image, .. } => {
                // Without a window there is no video to lay the overlay over yet.
                if let Some(renderer) = &mut viewer.renderer {
                    renderer.update_layer(LayerKind::Overlay, image.resolution(), image.data());
                    renderer.window().win.request_redraw();
                }
            }
        }
    }

    fn handle_window_event(&mut self, id: WindowId, event: WindowEvent<'_>) {
        let Some(key) = self.win_id_to_key.get(&id).cloned() else {
            return;
        };
        match event {
            WindowEvent::Resized(_) => {
                if let Some(viewer) = self.viewers.get_mut(&key) {
                    if let Some(renderer) = &mut viewer.renderer {
                        renderer.resized();
                        let res = renderer.window().inner_resolution();
                        log::debug!("viewer '{key}' resized to {res}");
                        viewer.display.set(res);
                        renderer.window().win.request_redraw();
                    }
                }
            }
            WindowEvent::CloseRequested => {
                log::debug!("viewer '{key}' closed");
                self.win_id_to_key.remove(&id);
                self.closed.insert(key.clone());
                if let Some(viewer) = self.viewers.remove(&key) {
                    if let Some(hook) = viewer.on_close {
                        hook();
                    }
                    // Dropping the renderer closes the window.
                }
            }
            _ => {}
        }
    }

    fn redraw(&mut self, id: WindowId) {
        let Some(key) = self.win_id_to_key.get(&id) else {
            return;
        };
        if let Some(renderer) = self
            .viewers
            .get_mut(key)
            .and_then(|viewer| viewer.renderer.as_mut())
        {
            renderer.redraw();
        }
    }

    fn run(mut self, event_loop: EventLoop<Msg>) -> ! {
        event_loop.run(move |event, target, flow| {
            *flow = ControlFlow::Wait;
            match event {
                Event::UserEvent(msg) => self.handle_msg(target, msg),
                Event::WindowEvent { window_id, event } => {
                    self.handle_window_event(window_id, event)
                }
                Event::RedrawRequested(window_id) => self.redraw(window_id),
                _ => {}
            }
        })
    }
}

fn open_window(
    target: &EventLoopWindowTarget<Msg>,
    gpu: &Rc<Gpu>,
    key: &str,
    viewer: &ViewerState,
    res: Resolution,
) -> anyhow::Result<Renderer> {
    log::debug!("creating window for viewer '{key}' at {res}");
    let title = viewer.title.as_deref().unwrap_or(key);
    let window = Window::open(target, title, res)?;
    viewer.display.set(window.inner_resolution());
    Renderer::new(window, gpu.clone())
}

static PROXY: OnceLock<Mutex<EventLoopProxy<Msg>>> = OnceLock::new();

/// Sends a message to the event loop.
///
/// Messages sent while no event loop is running are dropped.
fn send(msg: Msg) {
    let Some(proxy) = PROXY.get() else {
        log::trace!("no GUI event loop running, dropping message");
        return;
    };
    if proxy.lock().unwrap().send_event(msg).is_err() {
        log::trace!("GUI event loop has exited, dropping message");
    }
}

pub(crate) fn run<F, R>(cb: F) -> !
where
    F: FnOnce() -> R + Send + 'static,
    R: Termination + Send,
{
    let event_loop = EventLoopBuilder::with_user_event().build();
    if PROXY.set(Mutex::new(event_loop.create_proxy())).is_err() {
        panic!("GUI event loop already initialized");
    }

    let gpu = match pollster::block_on(Gpu::open()) {
        Ok(gpu) => gpu,
        Err(e) => {
            log::error!("failed to open GPU: {e:#}");
            process::exit(1);
        }
    };

    // Library is now initialized; spawn another thread to run the application code.
    std::thread::spawn(move || {
        let result = catch_unwind(AssertUnwindSafe(cb));
        match result {
            Ok(r) => {
                if r.is_success() {
                    process::exit(0);
                } else {
                    r.report(); // may print the error message
                    process::exit(1);
                }
            }
            Err(_payload) => {
                // The panic hook already printed the message, exit with 101 like libstd does.
                process::exit(101);
            }
        }
    });

    Gui::new(gpu).run(event_loop);
}

/// A window showing live video with a pose overlay on top.
///
/// The window opens when the first video frame arrives and is sized to it. It can be resized;
/// the current size is published through [`Viewer::display_size`], which is what the overlay is
/// drawn at.
pub struct Viewer {
    key: String,
    display: DisplaySize,
}

impl Viewer {
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        let display = DisplaySize::default();
        send(Msg::Register {
            key: key.clone(),
            display: display.clone(),
        });
        Self { key, display }
    }

    /// The size the video is currently displayed at. Zero until the window is open.
    pub fn display_size(&self) -> DisplaySize {
        self.display.clone()
    }

    pub fn set_title(&self, title: impl Into<String>) {
        send(Msg::Title {
            key: self.key.clone(),
            title: title.into(),
        });
    }

    /// Registers a callback that runs on the GUI thread when the user closes the window.
    pub fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
        send(Msg::OnClose {
            key: self.key.clone(),
            hook: Box::new(hook),
        });
    }

    /// Shows `image` on the video layer.
    pub fn show_video(&self, image: &Arc<Image>) {
        send(Msg::Video {
            key: self.key.clone(),
            image: image.clone(),
        });
    }

    /// Returns a callback that shows every frame it is given, suitable as a camera frame hook.
    pub fn video_sink(&self) -> impl FnMut(&Arc<Image>) + Send + 'static {
        let key = self.key.clone();
        move |image| {
            send(Msg::Video {
                key: key.clone(),
                image: image.clone(),
            })
        }
    }

    /// Returns the overlay layer as a drawable [`Surface`].
    pub fn overlay(&self) -> ViewerOverlay {
        ViewerOverlay {
            key: self.key.clone(),
            image: Image::new(0, 0),
        }
    }
}

/// The overlay layer of a [`Viewer`].
///
/// Drawing happens into a local image; [`Surface::present`] hands a copy to the window.
pub struct ViewerOverlay {
    key: String,
    image: Image,
}

impl Surface for ViewerOverlay {
    fn clear(&mut self, size: Resolution) {
        Surface::clear(&mut self.image, size);
    }

    fn fill_circle(&mut self, x: f32, y: f32, radius: f32, color: Color) {
        self.image.fill_circle(x, y, radius, color);
    }

    fn line(&mut self, start: (f32, f32), end: (f32, f32), width: u32, color: Color) {
        self.image.line(start, end, width, color);
    }

    fn present(&mut self) {
        send(Msg::Overlay {
            key: self.key.clone(),
            image: self.image.clone(),
        });
    }
}
