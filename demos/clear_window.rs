//! Opens a window, negotiates the full presentation pipeline, and idles
//! until the window is closed. No rendering; this only exercises the
//! bootstrap and its teardown.

use ash::vk;
use swapstrap::{ContextBuilder, GraphicsContext};
use winit::{
    dpi::LogicalSize,
    event::{Event, WindowEvent},
    event_loop::{ControlFlow, EventLoop},
    window::WindowBuilder,
};

fn main() {
    tracing_subscriber::fmt::init();

    let event_loop = EventLoop::new();
    let window = WindowBuilder::new()
        .with_title("swapstrap")
        .with_inner_size(LogicalSize::new(800.0, 600.0))
        .with_resizable(false)
        .build(&event_loop)
        .expect("window creation failed");

    let size = window.inner_size();
    let context = ContextBuilder::new()
        .app_name("clear_window")
        .expect("app name")
        .engine_name("swapstrap")
        .expect("engine name");
    let graphics = unsafe {
        GraphicsContext::builder().context(context).initialize(
            &window,
            vk::Extent2D {
                width: size.width,
                height: size.height,
            },
        )
    }
    .expect("graphics initialization failed");

    println!(
        "negotiated {} swapchain images at {}x{}",
        graphics.swapchain().images().len(),
        graphics.swapchain().extent().width,
        graphics.swapchain().extent().height,
    );

    let mut graphics = Some(graphics);
    event_loop.run(move |event, _, control_flow| {
        *control_flow = ControlFlow::Wait;
        if let Event::WindowEvent {
            event: WindowEvent::CloseRequested,
            ..
        } = event
        {
            // Tear down before the window goes away; drop order inside
            // GraphicsContext is the reverse of creation order.
            graphics.take();
            *control_flow = ControlFlow::Exit;
        }
    });
}
