//! 随机令牌生成：访问码、分享链接 ID 与一次性验证码。

use rand::Rng;

/// Upper-case letters and digits, used for access codes.
pub const ACCESS_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
/// Mixed-case alphanumerics, used for sharing link ids.
pub const LINK_ID_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const OTP_ALPHABET: &[u8] = b"0123456789";
pub const OTP_LENGTH: usize = 6;

/// 令牌生成器。
pub trait CodeGenerator: Send + Sync {
    /// 从 `alphabet` 中均匀抽取 `length` 个字符。
    fn generate(&self, alphabet: &[u8], length: usize) -> String;

    fn access_code(&self, length: usize) -> String {
        self.generate(ACCESS_CODE_ALPHABET, length)
    }

    fn link_id(&self, length: usize) -> String {
        self.generate(LINK_ID_ALPHABET, length)
    }

    /// 六位十进制数字，允许前导零。
    fn otp_secret(&self) -> String {
        self.generate(OTP_ALPHABET, OTP_LENGTH)
    }
}

/// 基于线程本地 CSPRNG 的生成器。
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomCodeGenerator;

impl CodeGenerator for RandomCodeGenerator {
    fn generate(&self, alphabet: &[u8], length: usize) -> String {
        if alphabet.is_empty() {
            return String::new();
        }
        let mut rng = rand::rng();
        (0..length)
            .map(|_| char::from(alphabet[rng.random_range(0..alphabet.len())]))
            .collect()
    }
}

/// Hands out queued tokens first, then falls back to random output.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    queue: std::sync::Mutex<std::collections::VecDeque<String>>,
}

#[cfg(test)]
impl ScriptedGenerator {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queue: std::sync::Mutex::new(tokens.into_iter().map(Into::into).collect()),
        }
    }

    pub fn push(&self, token: &str) {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(token.to_string());
    }
}

#[cfg(test)]
impl CodeGenerator for ScriptedGenerator {
    fn generate(&self, alphabet: &[u8], length: usize) -> String {
        let next = self
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        next.unwrap_or_else(|| RandomCodeGenerator.generate(alphabet, length))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_codes_use_upper_alphanumerics() {
        let code = RandomCodeGenerator.access_code(6);
        assert_eq!(code.len(), 6);
        assert!(code.bytes().all(|b| ACCESS_CODE_ALPHABET.contains(&b)));
    }

    #[test]
    fn link_ids_use_mixed_case_alphabet() {
        let id = RandomCodeGenerator.link_id(8);
        assert_eq!(id.len(), 8);
        assert!(id.bytes().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn otp_secret_is_six_digits() {
        for _ in 0..200 {
            let otp = RandomCodeGenerator.otp_secret();
            assert_eq!(otp.len(), 6);
            assert!(otp.bytes().all(|b| b.is_ascii_digit()));
        }
    }

    #[test]
    fn otp_digits_cover_zero() {
        // leading zeros must be possible; the first position sees every digit
        let firsts: std::collections::HashSet<char> = (0..2000)
            .filter_map(|_| RandomCodeGenerator.otp_secret().chars().next())
            .collect();
        assert!(firsts.contains(&'0'));
    }

    #[test]
    fn scripted_generator_falls_back_to_random() {
        let generator = ScriptedGenerator::new(["AB12CD"]);
        assert_eq!(generator.access_code(6), "AB12CD");
        let fallback = generator.access_code(6);
        assert_eq!(fallback.len(), 6);
    }
}
