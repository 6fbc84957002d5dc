use jiff::SignedDuration;

use crate::time::Duration;

impl TryFrom<Duration> for SignedDuration {
    type Error = jiff::Error;

    fn try_from(value: Duration) -> Result<Self, Self::Error> {
        Self::try_from(Into::<std::time::Duration>::into(value))
    }
}

impl TryFrom<SignedDuration> for Duration {
    type Error = jiff::Error;

    fn try_from(value: SignedDuration) -> Result<Self, Self::Error> {
        let std_duration = std::time::Duration::try_from(value)?;
        Ok(Self::from(std_duration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_duration_conversion() {
        let duration: Duration = "1h30m".parse().unwrap();
        let signed = SignedDuration::try_from(duration).unwrap();
        assert_eq!(signed.as_secs(), 5400);

        assert!(Duration::try_from(SignedDuration::from_secs(-1)).is_err());
    }
}
