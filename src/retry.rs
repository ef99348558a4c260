macro_rules! retry_storage_operation {
    ($context:expr, $max_attempts:expr, $base_delay_ms:expr, $operation:expr) => {{
        let max_attempts: u32 = ($max_attempts).max(1);
        let base_delay_ms: u64 = $base_delay_ms;

        let context_value: String = $context.into();
        let mut attempt: u32 = 1;

        loop {
            match ($operation).await {
                Ok(value) => break Ok(value),
                Err(err) if attempt >= max_attempts => break Err(err),
                Err(err) => {
                    let delay_ms = base_delay_ms * attempt as u64
                        + fastrand::u64(0..=base_delay_ms / 2);
                    log::warn!(
                        "Attempt {}/{} for {} failed: {}. Retrying in {}ms.",
                        attempt,
                        max_attempts,
                        context_value,
                        err,
                        delay_ms
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
            }
        }
    }};
}

pub(crate) use retry_storage_operation;
