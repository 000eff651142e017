use rand::RngCore;
use sha2::{Digest, Sha256};

use super::{CHALLENGE_LEN, RESPONSE_LEN};

pub fn new_challenge() -> [u8; CHALLENGE_LEN] {
    let mut c = [0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut c);
    c
}

/// SHA-256(secreto ‖ challenge)
pub fn keyed_response(secret: &str, challenge: &[u8; CHALLENGE_LEN]) -> [u8; RESPONSE_LEN] {
    let mut h = Sha256::new();
    h.update(secret.as_bytes());
    h.update(challenge);
    h.finalize().into()
}

/// Compara en tiempo constante.
pub fn verify(secret: &str, challenge: &[u8; CHALLENGE_LEN], response: &[u8; RESPONSE_LEN]) -> bool {
    let expected = keyed_response(secret, challenge);
    expected
        .iter()
        .zip(response.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respuesta_con_el_secreto_correcto_valida() {
        let c = new_challenge();
        let r = keyed_response("s3cret", &c);
        assert!(verify("s3cret", &c, &r));
    }

    #[test]
    fn secreto_distinto_o_challenge_distinto_no_valida() {
        let c = new_challenge();
        let r = keyed_response("s3cret", &c);
        assert!(!verify("otro", &c, &r));

        let mut c2 = c;
        c2[0] ^= 0xff;
        assert!(!verify("s3cret", &c2, &r));
    }

    #[test]
    fn challenges_no_se_repiten() {
        assert_ne!(new_challenge(), new_challenge());
    }
}
