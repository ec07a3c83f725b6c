//! Tipos de erro para a capacidade de geração de texto.
//!
//! Define [`GenerateError`] com variantes para rate limiting, cota diária,
//! timeouts, falhas de conexão e erros da API. A classificação entre erro
//! transitório e permanente fica em [`GenerateError::is_transient`], o único
//! ponto consultado pela política de retentativa do processador.

use thiserror::Error;

use crate::job::ErrorKind;

/// Erros que podem ocorrer ao chamar o gerador externo.
///
/// - Transitórios (vale a pena retentar): [`RateLimited`](GenerateError::RateLimited),
///   [`Timeout`](GenerateError::Timeout), [`Connection`](GenerateError::Connection)
///   e [`ApiError`](GenerateError::ApiError) com status 5xx.
/// - Permanentes: [`QuotaExhausted`](GenerateError::QuotaExhausted),
///   [`ApiError`](GenerateError::ApiError) 4xx e [`InvalidResponse`](GenerateError::InvalidResponse).
#[derive(Debug, Error)]
pub enum GenerateError {
    /// O servidor retornou HTTP 429 (rate limit).
    /// O campo `retry_after_ms` indica quantos milissegundos esperar antes de retentar.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// A cota diária foi esgotada; retentar no mesmo dia não adianta.
    #[error("daily quota exhausted: {0}")]
    QuotaExhausted(String),

    /// A chamada não terminou dentro do prazo configurado.
    #[error("request timed out")]
    Timeout,

    /// Falha de rede subjacente (DNS, conexão recusada, conexão resetada).
    #[error("connection error: {0}")]
    Connection(String),

    /// Erro retornado pela API (ex.: 401 chave inválida, 500 erro interno).
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// A resposta chegou mas não pôde ser interpretada.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl GenerateError {
    /// Retorna `true` quando uma nova tentativa pode ter sucesso.
    pub fn is_transient(&self) -> bool {
        match self {
            GenerateError::RateLimited { .. } | GenerateError::Timeout | GenerateError::Connection(_) => true,
            GenerateError::ApiError { status, .. } => *status >= 500,
            GenerateError::QuotaExhausted(_) | GenerateError::InvalidResponse(_) => false,
        }
    }

    /// Espera mínima sugerida pelo servidor, quando houver.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            GenerateError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }

    /// Categoria persistida junto ao resultado da linha.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GenerateError::RateLimited { .. } => ErrorKind::RateLimited,
            GenerateError::QuotaExhausted(_) => ErrorKind::QuotaExhausted,
            GenerateError::Timeout => ErrorKind::Timeout,
            GenerateError::Connection(_) => ErrorKind::Connection,
            GenerateError::ApiError { .. } => ErrorKind::Api,
            GenerateError::InvalidResponse(_) => ErrorKind::InvalidResponse,
        }
    }
}

impl From<reqwest::Error> for GenerateError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GenerateError::Timeout
        } else if err.is_connect() || err.is_request() {
            GenerateError::Connection(err.to_string())
        } else if err.is_decode() || err.is_body() {
            GenerateError::InvalidResponse(err.to_string())
        } else {
            GenerateError::ApiError {
                status: err.status().map(|s| s.as_u16()).unwrap_or(0),
                message: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_display() {
        let err = GenerateError::RateLimited {
            retry_after_ms: 5000,
        };
        assert_eq!(err.to_string(), "rate limited, retry after 5000ms");
        assert_eq!(err.retry_after_ms(), Some(5000));
    }

    #[test]
    fn api_error_display() {
        let err = GenerateError::ApiError {
            status: 401,
            message: "Invalid API key".into(),
        };
        assert_eq!(err.to_string(), "API error (status 401): Invalid API key");
    }

    #[test]
    fn transient_classification() {
        assert!(GenerateError::RateLimited { retry_after_ms: 1 }.is_transient());
        assert!(GenerateError::Timeout.is_transient());
        assert!(GenerateError::Connection("reset".into()).is_transient());
        assert!(
            GenerateError::ApiError {
                status: 503,
                message: "overloaded".into()
            }
            .is_transient()
        );

        assert!(!GenerateError::QuotaExhausted("per day".into()).is_transient());
        assert!(
            !GenerateError::ApiError {
                status: 400,
                message: "bad".into()
            }
            .is_transient()
        );
        assert!(!GenerateError::InvalidResponse("empty".into()).is_transient());
    }

    #[test]
    fn kind_mapping() {
        assert_eq!(GenerateError::Timeout.kind(), ErrorKind::Timeout);
        assert_eq!(
            GenerateError::QuotaExhausted("x".into()).kind(),
            ErrorKind::QuotaExhausted
        );
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<GenerateError>();
    }
}
