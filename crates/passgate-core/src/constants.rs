/// Liveness defaults per protocol, seconds (interval, timeout)
pub const POCKET_PING_DEFAULTS: (u64, u64) = (10, 15);
pub const GAT_PING_DEFAULTS: (u64, u64) = (10, 15);
pub const JSP_PING_DEFAULTS: (u64, u64) = (10, 15);
pub const SPHINX_PING_DEFAULTS: (u64, u64) = (5, 10);

/// Reconnection backoff floor, seconds
pub const RECONNECT_FLOOR_SECS: f64 = 0.1;

/// Terminal display timings, milliseconds
pub const DEFAULT_PASS_TIME_MS: u32 = 3000;
pub const DENY_DISPLAY_MS: u32 = 1500;
pub const INFO_DISPLAY_MS: u32 = 3000;
pub const LOCK_WAIT_MS: u16 = 1500;
pub const CARD_CAPTURE_TIMEOUT_MS: u32 = 1500;

/// UID length bounds on the wire (hex characters)
pub const MIN_UID_LENGTH: usize = 1;
pub const MAX_UID_LENGTH: usize = 32;

/// Deny-list UID bounds (hex characters)
pub const MIN_DENY_UID_LENGTH: usize = 8;
pub const MAX_DENY_UID_LENGTH: usize = 20;

/// Per-connection receive buffer cap
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Default messages
pub const MSG_WAITING: &str = "Ожидание...";
pub const MSG_PROCEED: &str = "Проходите";
pub const MSG_DENIED: &str = "Доступ запрещен";
pub const MSG_DB_ERROR: &str = "Ошибка связи с БД";
pub const MSG_LINK_ERROR: &str = "Ошибка связи. Обратитесь на рецепцию.";
pub const MSG_NOT_PASSED: &str = "Проход не зарегистрирован";
pub const MSG_TAG_NOT_READ: &str = "Метка не прочитана";
pub const MSG_TEMP_CARD: &str = "Это карта\nдля\nкартоприемника";
pub const MSG_RETURN_LOCKERS: &str = "Сдайте шкафы:";
pub const MSG_CAM_NO: &str = "Лицо не распознано";
pub const MSG_CAM_NF: &str = "НЕТ ФОТО !!! Обратитесь в отдел продаж";
pub const MSG_CAM_FAIL: &str = "Ошибка распознавания";

/// Identification-poller PID bounds (decimal digits)
pub const MIN_PID_LENGTH: usize = 3;
pub const MAX_PID_LENGTH: usize = 15;
