use tracing_subscriber::{fmt::time::ChronoLocal, EnvFilter};

/// Логирование с временными метками.
///
/// Фильтр берётся из `RUST_LOG`, по умолчанию `info`. Если логирование
/// выключено конфигурацией, подписчик не устанавливается вовсе.
pub fn init() {
    // Проверяем конфигурацию логирования
    if !crate::config::LOGGING_ENABLED || !crate::config::dev::ENABLE_LOGGING {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // повторная инициализация (например, из тестов) не ошибка
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".into()))
        .with_writer(std::io::stderr)
        .try_init();
}
