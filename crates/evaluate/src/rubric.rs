//! Fixed grading instructions sent as the system turn.

use crate::score::ScoreStrategy;
use serde::{Deserialize, Serialize};

/// Marker for the final score line the model is asked to emit.
pub const SCORE_DELIMITER: &str = "PUNTAJE_FINAL:";

const FULL_SCRIPT: &str = r#"
Eres un experto en feedback y ventas por teléfono. Analiza esta conversación evaluando su cumplimiento con los PASOS OBLIGATORIOS:

###
PASOS OBLIGATORIOS (✅)

1. **Apertura**:
   - Saludo casual ("¡Hola!")
   - Usar solo el nombre del lead
   - Presentarte solo con tu nombre
   - Mencionar que llamas del Taller de Bienes Raíces con Carlos Devis

2. **Romper el hielo**:
   - Elegir UN solo tema: ciudad, clima, gastronomía o lugares turísticos
   - Hacer preguntas sobre el tema elegido

3. **Identificación del dolor/necesidad**:
   - Preguntar motivación sobre bienes raíces
   - Identificar obstáculos
   - Profundizar con preguntas si no es claro
   - Confirmar el dolor identificado

4. **Presentación de credenciales**:
   - Mencionar los 700+ testimonios de éxito
   - Compartir un ejemplo relevante
   - Preguntar si quisieran lograr resultados similares

5. **Presentación de la metodología**:
   - Explicar los 5 pasos:
     1. Cambio de pensamiento
     2. Organización financiera
     3. Ahorrar
     4. Invertir
     5. Repetir el proceso

6. **Verificar dudas**:
   - Preguntar si hay dudas o preguntas

7. **Presentación de programas**:
   - Mencionar las dos opciones principales:
     - Programa Avanzado ($1,497 USD)
     - Programa Mentoría ($4,999 USD)

8. **Cierre (Obligatorio)**:
   - Mencionar SIEMPRE el precio de página
   - Ofrecer SIEMPRE precio promocional
   - Dar máximo 48 horas de plazo como último recurso

###

Para cada paso, indica si se cumplió (✅) o no (❌) con explicación breve.
Al final, da una calificación de 0 a 5 (5 = perfecta) y sugerencias de mejora.
"#;

const BRIEF_CHECKLIST: &str = r#"Eres un experto en análisis de llamadas comerciales. Evalúa:
1. ✅ Apertura profesional
2. ✅ Identificación de necesidades
3. ✅ Presentación de solución
4. ✅ Manejo de objeciones
5. ✅ Cierre efectivo

Para cada punto indica ✅ o ❌ con breve explicación.
Finaliza con puntuación 1-5 y feedback constructivo."#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rubric {
    /// Eight-step real-estate sales script, graded 0 to 5.
    Full,
    /// Five-point commercial call checklist, graded 1 to 5.
    Brief,
}

impl Rubric {
    pub fn text(self) -> &'static str {
        match self {
            Rubric::Full => FULL_SCRIPT.trim(),
            Rubric::Brief => BRIEF_CHECKLIST,
        }
    }

    /// Heuristic that matches how this rubric phrases its verdict.
    pub fn default_strategy(self) -> ScoreStrategy {
        match self {
            Rubric::Full => ScoreStrategy::LineScan,
            Rubric::Brief => ScoreStrategy::Checkmarks,
        }
    }

    pub fn scale(self) -> (f64, f64) {
        match self {
            Rubric::Full => (0.0, 5.0),
            Rubric::Brief => (1.0, 5.0),
        }
    }

    /// System instruction, optionally asking for a machine-readable score line.
    pub fn system_prompt(self, structured_score: bool) -> String {
        let mut prompt = self.text().to_string();
        if structured_score {
            let (lo, hi) = self.scale();
            prompt.push_str(&format!(
                "\n\nTermina tu respuesta con una última línea exactamente en el formato \
                 `{SCORE_DELIMITER} <n>/5`, donde <n> es tu calificación numérica entre {lo} y {hi}."
            ));
        }
        prompt
    }
}
