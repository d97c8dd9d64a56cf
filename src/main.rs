fn main() {
    filament_pipeline::cli::run();
}
