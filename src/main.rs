mod app;
mod engine;
mod launch;
mod renderer;

fn main() -> eframe::Result<()> {
    let _ = env_logger::Builder::from_default_env()
        .format_timestamp_secs()
        .try_init();

    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    let (initial_request, initial_status) = match launch::parse_launch_request_from_args(&cli_args)
    {
        Ok(request) => (request, None),
        Err(err) => (None, Some(format!("Launch URL/args error: {err}"))),
    };

    let native_options = eframe::NativeOptions {
        viewport: eframe::egui::ViewportBuilder::default()
            .with_inner_size([1440.0, 900.0])
            .with_resizable(true),
        ..Default::default()
    };

    eframe::run_native(
        "Perspecta Compare",
        native_options,
        Box::new(move |cc| {
            Ok(Box::new(app::CompareApp::new(
                cc.egui_ctx.clone(),
                initial_request.clone(),
                initial_status.clone(),
            )))
        }),
    )
}
